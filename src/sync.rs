//! Sleeping synchronization: semaphores, locks, condition variables.
//!
//! All three are legal only from thread context; the single exception is
//! `Semaphore::up`, which interrupt handlers may call to release a waiter.
//!
//! Locks track their owner. When the priority scheduler is selected, a
//! contended `acquire` donates the blocker's effective priority up the
//! ownership chain (to a bounded depth), and `release` recomputes the
//! owner's effective priority from the waiters of the locks it still holds.

use core::ptr;

use crate::intr::{self, HeldInterrupts, IntrCell};
use crate::list::{List, ListEntry};
use crate::param::DONATION_DEPTH_MAX;
use crate::thread::{self, Policy, Thread};
use crate::container_of;

/// Counting semaphore: a value plus a list of blocked waiters.
pub struct Semaphore {
    inner: IntrCell<SemInner>,
}

struct SemInner {
    value: i64,
    waiters: List,
}

impl Semaphore {
    pub const fn new(value: i64) -> Self {
        Self {
            inner: IntrCell::new(SemInner {
                value,
                waiters: List::new(),
            }),
        }
    }

    /// Decrement, blocking while the value is zero.
    pub fn down(&self) {
        assert!(!intr::in_interrupt_context());
        let mut held = HeldInterrupts::new();
        loop {
            let inner = self.inner.borrow_mut(&mut held);
            if inner.value > 0 {
                inner.value -= 1;
                break;
            }
            let cur = thread::current();
            // SAFETY: interrupts are off; the running thread's elem is
            // unlinked (it is on no ready queue while RUNNING).
            unsafe { inner.waiters.push_back(&mut (*cur).elem) };
            thread::block();
        }
        drop(held);
    }

    /// Decrement without blocking. Returns whether it succeeded.
    pub fn try_down(&self) -> bool {
        let mut held = HeldInterrupts::new();
        let inner = self.inner.borrow_mut(&mut held);
        if inner.value > 0 {
            inner.value -= 1;
            true
        } else {
            false
        }
    }

    /// Increment and release the best waiter, if any. Safe from interrupt
    /// context.
    pub fn up(&self) {
        let woke = {
            let mut held = HeldInterrupts::new();
            let inner = self.inner.borrow_mut(&mut held);
            inner.value += 1;
            // The waiter released is the one the scheduler would pick:
            // highest effective priority under the priority disciplines,
            // FIFO otherwise.
            thread::policy::select_next(thread::current_policy(), &mut inner.waiters)
        };
        if let Some(t) = woke {
            thread::unblock(t);
        }
    }

    pub fn value(&self) -> i64 {
        let mut held = HeldInterrupts::new();
        self.inner.borrow_mut(&mut held).value
    }

    /// Highest effective priority among the blocked waiters.
    pub(crate) fn max_waiter_priority(&self, held: &mut HeldInterrupts) -> Option<u32> {
        let inner = self.inner.borrow_mut(held);
        let mut best: Option<u32> = None;
        let mut e = inner.waiters.front();
        while let Some(entry) = e {
            let t = container_of!(entry, Thread, elem);
            // SAFETY: waiters are live blocked threads.
            let pri = unsafe { (*t).effective_priority };
            best = Some(best.map_or(pri, |b| b.max(pri)));
            e = inner.waiters.next_of(entry);
        }
        best
    }
}

/// Mutual-exclusion lock: an owner pointer over a binary semaphore.
#[repr(C)]
pub struct Lock {
    inner: IntrCell<LockInner>,
    sema: Semaphore,
}

#[repr(C)]
struct LockInner {
    holder: *mut Thread,
    /// Membership in the holder's held-locks list.
    elem: ListEntry,
}

impl Lock {
    pub const fn new() -> Self {
        Self {
            inner: IntrCell::new(LockInner {
                holder: ptr::null_mut(),
                elem: ListEntry::new(),
            }),
            sema: Semaphore::new(1),
        }
    }

    /// Recover the lock from its held-list entry.
    ///
    /// # Safety
    ///
    /// `elem` must be the `elem` field of a live `LockInner`.
    unsafe fn from_held_elem(elem: *mut ListEntry) -> *mut Lock {
        let inner = container_of!(elem, LockInner, elem);
        // LockInner sits at offset zero of the repr(C) Lock.
        inner as *mut Lock
    }

    pub fn held_by_current_thread(&self) -> bool {
        let mut held = HeldInterrupts::new();
        self.inner.borrow_mut(&mut held).holder == thread::current()
    }

    /// Acquire, blocking until the owner releases. Donates priority to the
    /// ownership chain first when the priority scheduler is in use.
    pub fn acquire(&self) {
        assert!(!intr::in_interrupt_context());
        assert!(!self.held_by_current_thread(), "recursive lock acquire");

        let cur = thread::current();
        if thread::current_policy() == Policy::Priority {
            let mut held = HeldInterrupts::new();
            if !self.inner.borrow_mut(&mut held).holder.is_null() {
                // SAFETY: interrupts are off; cur is the running thread.
                unsafe { (*cur).waiting_on = self as *const Lock as *mut Lock };
                donate_chain(cur, self, &mut held);
            }
        }

        self.sema.down();

        let mut held = HeldInterrupts::new();
        let inner = self.inner.borrow_mut(&mut held);
        inner.holder = cur;
        // SAFETY: interrupts off; the lock's elem is unlinked while unheld.
        unsafe {
            (*cur).waiting_on = ptr::null_mut();
            (*cur).held_locks.push_back(&mut inner.elem);
        }
    }

    /// Release. Asserts the caller owns the lock, recomputes the caller's
    /// effective priority from its remaining held locks, and wakes the best
    /// waiter.
    pub fn release(&self) {
        assert!(
            self.held_by_current_thread(),
            "lock released by a non-owner"
        );
        let cur = thread::current();
        {
            let mut held = HeldInterrupts::new();
            let inner = self.inner.borrow_mut(&mut held);
            inner.holder = ptr::null_mut();
            // SAFETY: the lock is on cur's held list.
            unsafe { List::remove(&mut inner.elem) };

            if thread::current_policy() == Policy::Priority {
                let eff = recompute_effective(cur, &mut held);
                // SAFETY: interrupts off; cur is the running thread.
                unsafe { (*cur).effective_priority = eff };
            }
        }
        self.sema.up();
        thread::policy::on_priority_change(cur);
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

/// Walk the ownership chain from `lock`, raising every holder below the
/// donor's effective priority. Bounded depth keeps a cyclic mistake from
/// hanging the kernel.
fn donate_chain(donor: *mut Thread, lock: &Lock, held: &mut HeldInterrupts) {
    // SAFETY: interrupts are off; the donor is live.
    let donated = unsafe { (*donor).effective_priority };
    let mut lock = lock as *const Lock;
    for _ in 0..DONATION_DEPTH_MAX {
        // SAFETY: lock points at a live Lock; holders are live threads.
        let holder = unsafe { (*lock).inner.borrow_mut(held).holder };
        if holder.is_null() {
            break;
        }
        // SAFETY: as above.
        unsafe {
            if (*holder).effective_priority < donated {
                (*holder).effective_priority = donated;
            }
            if (*holder).waiting_on.is_null() {
                break;
            }
            lock = (*holder).waiting_on;
        }
    }
}

/// The effective priority a thread deserves: its base, or the best waiter
/// on any lock it still holds, whichever is higher.
pub(crate) fn recompute_effective(t: *mut Thread, held: &mut HeldInterrupts) -> u32 {
    // SAFETY: interrupts are off; t is live.
    let mut best = unsafe { (*t).priority };
    // SAFETY: held_locks entries are live LockInners.
    unsafe {
        let locks = &mut (*t).held_locks;
        let mut e = locks.front();
        while let Some(entry) = e {
            let lock = Lock::from_held_elem(entry);
            if let Some(pri) = (*lock).sema.max_waiter_priority(held) {
                best = best.max(pri);
            }
            e = locks.next_of(entry);
        }
    }
    best
}

/// Condition variable: a list of one-shot semaphores, one per waiter,
/// stacked in the waiters' own frames.
pub struct Condvar {
    waiters: IntrCell<List>,
}

#[repr(C)]
struct CondWaiter {
    elem: ListEntry,
    thread: *mut Thread,
    sema: Semaphore,
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            waiters: IntrCell::new(List::new()),
        }
    }

    /// Atomically release `lock` and wait to be signalled, then reacquire.
    pub fn wait(&self, lock: &Lock) {
        assert!(lock.held_by_current_thread());
        let mut waiter = CondWaiter {
            elem: ListEntry::new(),
            thread: thread::current(),
            sema: Semaphore::new(0),
        };
        {
            let mut held = HeldInterrupts::new();
            // SAFETY: the waiter lives on this stack until signalled, and
            // `down` below does not return before `signal` unlinks it.
            unsafe { self.waiters.borrow_mut(&mut held).push_back(&mut waiter.elem) };
        }
        lock.release();
        waiter.sema.down();
        lock.acquire();
    }

    /// Wake one waiter: the highest-priority one under the priority
    /// disciplines, the oldest otherwise.
    pub fn signal(&self, lock: &Lock) {
        assert!(lock.held_by_current_thread());
        if let Some(w) = self.take_waiter() {
            // SAFETY: the waiter is parked in `wait` until this up.
            unsafe { (*w).sema.up() };
        }
    }

    /// Wake every waiter.
    pub fn broadcast(&self, lock: &Lock) {
        assert!(lock.held_by_current_thread());
        while let Some(w) = self.take_waiter() {
            // SAFETY: as in signal.
            unsafe { (*w).sema.up() };
        }
    }

    fn take_waiter(&self) -> Option<*mut CondWaiter> {
        let mut held = HeldInterrupts::new();
        let waiters = self.waiters.borrow_mut(&mut held);
        let pick_priority = matches!(
            thread::current_policy(),
            Policy::Priority | Policy::Mlfqs
        );
        let mut best: Option<*mut ListEntry> = None;
        let mut e = waiters.front();
        while let Some(entry) = e {
            let better = match best {
                None => true,
                Some(b) if pick_priority => {
                    let w = container_of!(entry, CondWaiter, elem);
                    let bw = container_of!(b, CondWaiter, elem);
                    // SAFETY: listed waiters are live stack frames of
                    // blocked threads.
                    unsafe {
                        (*(*w).thread).effective_priority > (*(*bw).thread).effective_priority
                    }
                }
                Some(_) => false,
            };
            if better {
                best = Some(entry);
            }
            e = waiters.next_of(entry);
        }
        let entry = best?;
        // SAFETY: entry is linked on this condvar's list.
        unsafe { List::remove(entry) };
        Some(container_of!(entry, CondWaiter, elem))
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semaphore_down_up_uncontested_preserves_value() {
        let sema = Semaphore::new(1);
        assert!(sema.try_down());
        assert_eq!(sema.value(), 0);
        sema.up();
        assert_eq!(sema.value(), 1);
    }

    #[test]
    fn try_down_fails_at_zero() {
        let sema = Semaphore::new(0);
        assert!(!sema.try_down());
        sema.up();
        assert!(sema.try_down());
        assert!(!sema.try_down());
    }

    #[test]
    fn donation_raises_holder() {
        let mut holder = Box::new(Thread::zeroed());
        holder.priority = 10;
        holder.effective_priority = 10;
        let mut donor = Box::new(Thread::zeroed());
        donor.priority = 30;
        donor.effective_priority = 30;

        let lock = Lock::new();
        let mut held = HeldInterrupts::new();
        lock.inner.borrow_mut(&mut held).holder = holder.as_mut();

        donate_chain(donor.as_mut(), &lock, &mut held);
        assert_eq!(holder.effective_priority, 30);

        // Donating a lower priority changes nothing.
        let mut weak = Box::new(Thread::zeroed());
        weak.priority = 5;
        weak.effective_priority = 5;
        donate_chain(weak.as_mut(), &lock, &mut held);
        assert_eq!(holder.effective_priority, 30);
    }

    #[test]
    fn donation_follows_the_chain() {
        // c holds inner_lock; b holds outer_lock and waits on inner_lock;
        // a donor at 40 must raise both.
        let mut a = Box::new(Thread::zeroed());
        a.effective_priority = 40;
        let mut b = Box::new(Thread::zeroed());
        b.priority = 20;
        b.effective_priority = 20;
        let mut c = Box::new(Thread::zeroed());
        c.priority = 10;
        c.effective_priority = 10;

        let outer = Lock::new();
        let inner = Lock::new();
        let mut held = HeldInterrupts::new();
        outer.inner.borrow_mut(&mut held).holder = b.as_mut();
        inner.inner.borrow_mut(&mut held).holder = c.as_mut();
        b.waiting_on = &inner as *const Lock as *mut Lock;

        donate_chain(a.as_mut(), &outer, &mut held);
        assert_eq!(b.effective_priority, 40);
        assert_eq!(c.effective_priority, 40);
    }

    #[test]
    fn release_recomputes_from_remaining_waiters() {
        let mut holder = Box::new(Thread::zeroed());
        holder.priority = 10;
        holder.effective_priority = 30;

        // The holder keeps one lock whose waiter sits at 25.
        let kept = Box::leak(Box::new(Lock::new()));
        let mut waiter = Box::new(Thread::zeroed());
        waiter.effective_priority = 25;

        let mut held = HeldInterrupts::new();
        {
            let inner = kept.inner.borrow_mut(&mut held);
            inner.holder = holder.as_mut();
            unsafe { holder.held_locks.push_back(&mut inner.elem) };
        }
        {
            let sem = kept.sema.inner.borrow_mut(&mut held);
            unsafe { sem.waiters.push_back(&mut waiter.elem) };
        }

        let eff = recompute_effective(holder.as_mut(), &mut held);
        assert_eq!(eff, 25);

        // With the waiter gone, the base priority is all that remains.
        unsafe { List::remove(&mut waiter.elem) };
        let eff = recompute_effective(holder.as_mut(), &mut held);
        assert_eq!(eff, 10);
    }
}
