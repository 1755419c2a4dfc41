//! Periodic timer and the sleep queue.
//!
//! The firmware arms one-shot deadlines; every tick re-arms the next one at
//! `now + period`, accounts the tick, gives the scheduler its tick hook, and
//! drains the sleep queue. Sleepers insert themselves in wake-tick order, so
//! the drain only ever looks at the head.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::intr::{self, HeldInterrupts, IntrCell};
use crate::list::{List, ListEntry};
use crate::param::{TIMEBASE_FREQ, TIMER_FREQ_HZ};
use crate::riscv::{r_time, Sie, IRQ_S_TIMER};
use crate::thread::{self, Thread};
use crate::{container_of, sbi, trap};

/// Ticks since boot. 64 bits never wrap; the interrupt-off snapshot contract
/// is about preemption, not torn reads.
static TICKS: IntrCell<u64> = IntrCell::new(0);

/// BLOCKED threads ordered by `wake_up_tick` ascending. Sleepers insert,
/// the timer interrupt pops.
static SLEEPERS: IntrCell<List> = IntrCell::new(List::new());

/// Cycles of the platform counter per tick.
static PERIOD: AtomicU64 = AtomicU64::new(0);

/// Compute the tick period, install the interrupt handler, and arm the
/// first deadline.
pub fn init() {
    PERIOD.store(TIMEBASE_FREQ / TIMER_FREQ_HZ, Ordering::Relaxed);
    trap::register_irq(IRQ_S_TIMER, timer_intr);
    // SAFETY: the handler is installed.
    unsafe { (Sie::read() | Sie::STIE).write() };
    sbi::set_timer(r_time() + PERIOD.load(Ordering::Relaxed));
}

/// Ticks since boot, snapshotted with interrupts off.
pub fn ticks() -> u64 {
    let mut held = HeldInterrupts::new();
    *TICKS.borrow_mut(&mut held)
}

/// Sleep for `duration` ticks. Zero or negative durations return at once.
/// The calling thread is RUNNING again no earlier than `now + duration`.
pub fn sleep(duration: i64) {
    if duration <= 0 {
        return;
    }
    assert!(!intr::in_interrupt_context());

    let mut held = HeldInterrupts::new();
    let wake = *TICKS.borrow_mut(&mut held) + duration as u64;
    let cur = thread::current();
    // SAFETY: interrupts are off; the current thread is live and its
    // sleep_elem is unlinked (a running thread is never queued to sleep).
    unsafe {
        (*cur).wake_up_tick = wake;
        SLEEPERS
            .borrow_mut(&mut held)
            .insert_ordered(&mut (*cur).sleep_elem, wake_tick_less);
    }
    // Blocks with interrupts off; the switch path restores them.
    thread::block();
    drop(held);
}

/// Print the shutdown statistics line.
pub fn print_stats() {
    println!("Timer: {} ticks", ticks());
}

unsafe fn wake_tick_less(a: *const ListEntry, b: *const ListEntry) -> bool {
    let a = container_of!(a, Thread, sleep_elem);
    let b = container_of!(b, Thread, sleep_elem);
    // SAFETY: sleep-queue entries are live blocked threads.
    unsafe { (*a).wake_up_tick < (*b).wake_up_tick }
}

/// Pop the head of the sleep queue if its wake tick has arrived.
fn pop_expired(sleepers: &mut List, now: u64) -> Option<*mut Thread> {
    let head = sleepers.front()?;
    let t = container_of!(head, Thread, sleep_elem);
    // SAFETY: sleep-queue entries are live blocked threads.
    if unsafe { (*t).wake_up_tick } > now {
        return None;
    }
    // SAFETY: head is linked on the sleep queue.
    unsafe { List::remove(head) };
    Some(t)
}

/// The tick: runs from the trap dispatcher with interrupts off.
fn timer_intr() {
    let mut held = HeldInterrupts::new();
    let now = {
        let ticks = TICKS.borrow_mut(&mut held);
        *ticks += 1;
        *ticks
    };

    // Next deadline is absolute: current counter plus one period.
    sbi::set_timer(r_time() + PERIOD.load(Ordering::Relaxed));

    thread::tick();

    loop {
        let expired = pop_expired(SLEEPERS.borrow_mut(&mut held), now);
        match expired {
            Some(t) => thread::unblock(t),
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeper(wake: u64) -> Box<Thread> {
        let mut t = Box::new(Thread::zeroed());
        t.wake_up_tick = wake;
        t
    }

    fn wake_order(list: &mut List) -> Vec<u64> {
        let mut out = Vec::new();
        let mut e = list.front();
        while let Some(cur) = e {
            out.push(unsafe { (*container_of!(cur, Thread, sleep_elem)).wake_up_tick });
            e = list.next_of(cur);
        }
        out
    }

    #[test]
    fn sleep_queue_stays_sorted() {
        let mut list = List::new();
        let mut ts = [sleeper(30), sleeper(10), sleeper(20), sleeper(10)];
        for t in &mut ts {
            unsafe { list.insert_ordered(&mut t.sleep_elem, wake_tick_less) };
        }
        assert_eq!(wake_order(&mut list), [10, 10, 20, 30]);
        // Stability: of the two wake-10 sleepers, the earlier insertion
        // (index 1) sits in front of the later one (index 3).
        let first = list.front().unwrap();
        assert_eq!(
            container_of!(first, Thread, sleep_elem),
            ts[1].as_mut() as *mut Thread
        );
    }

    #[test]
    fn drain_pops_only_expired_in_order() {
        let mut list = List::new();
        let mut ts = [sleeper(5), sleeper(15), sleeper(25)];
        for t in &mut ts {
            unsafe { list.insert_ordered(&mut t.sleep_elem, wake_tick_less) };
        }

        assert!(pop_expired(&mut list, 4).is_none());

        let popped = pop_expired(&mut list, 20).unwrap();
        assert_eq!(unsafe { (*popped).wake_up_tick }, 5);
        let popped = pop_expired(&mut list, 20).unwrap();
        assert_eq!(unsafe { (*popped).wake_up_tick }, 15);
        // Every popped entry satisfied wake_up_tick <= now; 25 stays.
        assert!(pop_expired(&mut list, 20).is_none());
        assert_eq!(wake_order(&mut list), [25]);
    }

    #[test]
    fn zero_and_negative_sleeps_return() {
        // Must not touch the scheduler at all.
        sleep(0);
        sleep(-5);
    }
}
