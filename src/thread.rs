//! Thread runtime and scheduler.
//!
//! One hart, preemptive. Every thread owns a single page: the control block
//! sits at the bottom, the kernel stack grows down from the top, and a magic
//! word at the end of the control block catches overflow at switch time.
//! Reaping a DYING thread frees that one page.
//!
//! Live threads partition into the running thread, the ready set, and the
//! blocked set; a READY thread is on exactly one ready queue, a BLOCKED
//! thread on at most one waiter list plus, optionally, the sleep queue. The
//! idle thread never appears on a ready queue.
//!
//! Scheduler structures are protected by disabling interrupts; `unblock` is
//! the only operation that is also legal from interrupt context.

use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use arrayvec::ArrayString;
use static_assertions::const_assert;
use static_assertions::const_assert_eq;

use crate::error::{KernelError, Result};
use crate::intr::{self, HeldInterrupts, IntrCell};
use crate::kalloc::{self, Page, PoolKind};
use crate::list::{List, ListEntry};
use crate::memlayout::{ptov, vtop};
use crate::param::{NAME_MAX, PRI_DEFAULT, PRI_MAX, PRI_MIN, TIME_SLICE};
use crate::riscv::{intr_get, PGSIZE};
use crate::{container_of, process, sync, vm};

/// Written into the last field of every control block; checked at every
/// switch. A clobbered value means the kernel stack grew into the block.
pub const STACK_MAGIC: usize = 0x6b63_6174_735f_6f6e; // "no_stack"

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Status {
    Running,
    Ready,
    Blocked,
    Dying,
}

/// Scheduling policies selectable at boot with `-sched`. They share the
/// {on_tick, pick_next, on_unblock, on_priority_change} interface in
/// `mod policy`; FIFO is the reference discipline, the rest are pluggable
/// replacements behind the same four hooks.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Policy {
    Fifo,
    Priority,
    Mlfqs,
    FairShare,
}

impl Policy {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "fifo" => Some(Self::Fifo),
            "prio" | "priority" => Some(Self::Priority),
            "mlfqs" => Some(Self::Mlfqs),
            "fair" => Some(Self::FairShare),
            _ => None,
        }
    }
}

/// Callee-saved registers plus the return address, pushed at the top of a
/// blocked thread's kernel stack by `switch_threads`.
#[repr(C)]
pub struct Context {
    pub ra: usize,
    pub s: [usize; 12],
    _reserved: [usize; 3],
}

pub const CONTEXT_SIZE: usize = core::mem::size_of::<Context>();
const_assert_eq!(CONTEXT_SIZE, 128);
const_assert_eq!(core::mem::offset_of!(Context, ra), 0);
const_assert_eq!(core::mem::offset_of!(Context, s), 8);

pub type ThreadFunc = extern "C" fn(usize);

/// Thread control block.
#[repr(C)]
pub struct Thread {
    pub tid: usize,
    pub name: ArrayString<NAME_MAX>,
    pub status: Status,
    /// Base priority, as set at creation or by an explicit change.
    pub priority: u32,
    /// Base priority plus any donations; what the scheduler compares.
    pub effective_priority: u32,
    /// Saved kernel stack pointer while not running.
    pub stack_ptr: usize,
    /// Ready-queue or waiter-list membership.
    pub elem: ListEntry,
    /// Membership in the all-threads list.
    pub all_elem: ListEntry,
    /// Sleep-queue membership, orthogonal to `elem`.
    pub sleep_elem: ListEntry,
    pub wake_up_tick: u64,
    /// The lock this thread is blocked acquiring, for donation chains.
    pub waiting_on: *mut sync::Lock,
    /// Locks this thread currently holds.
    pub held_locks: List,
    /// Owning process, null for kernel threads. Kernel threads run on the
    /// kernel page directory.
    pub process: *mut process::Process,
    /// Ticks accumulated since the last mlfqs decay.
    pub recent_ticks: u64,
    /// Fair-share pass value; lowest pass runs next.
    pub pass: u64,
    pub magic: usize,
}

// The control block and a useful stack share one page.
const_assert!(core::mem::size_of::<Thread>() <= 1024);

impl Thread {
    pub const fn zeroed() -> Self {
        Self {
            tid: 0,
            name: ArrayString::new_const(),
            status: Status::Blocked,
            priority: PRI_DEFAULT,
            effective_priority: PRI_DEFAULT,
            stack_ptr: 0,
            elem: ListEntry::new(),
            all_elem: ListEntry::new(),
            sleep_elem: ListEntry::new(),
            wake_up_tick: 0,
            waiting_on: ptr::null_mut(),
            held_locks: List::new(),
            process: ptr::null_mut(),
            recent_ticks: 0,
            pass: 0,
            magic: STACK_MAGIC,
        }
    }

    fn set_name(&mut self, name: &str) {
        self.name.clear();
        for c in name.chars().take(NAME_MAX - 1) {
            let _ = self.name.try_push(c);
        }
    }
}

struct Sched {
    ready: List,
    all: List,
    current: *mut Thread,
    idle: *mut Thread,
    /// The thread we just switched away from; consumed by `schedule_tail`.
    prev: *mut Thread,
    policy: Policy,
    /// Ticks the running thread has held the hart.
    slice_ticks: u64,
}

static SCHED: IntrCell<Sched> = IntrCell::new(Sched {
    ready: List::new(),
    all: List::new(),
    current: ptr::null_mut(),
    idle: ptr::null_mut(),
    prev: ptr::null_mut(),
    policy: Policy::Fifo,
    slice_ticks: 0,
});

/// The boot thread's control block. Its stack is the boot stack, so it is
/// the one thread not backed by an allocated page.
static BOOT_THREAD: IntrCell<Thread> = IntrCell::new(Thread::zeroed());

static NEXT_TID: AtomicUsize = AtomicUsize::new(2);

/// Set by the tick hook when the running thread's slice expires; consumed
/// at trap exit.
static YIELD_REQUEST: AtomicBool = AtomicBool::new(false);

/// # Safety
///
/// Interrupts must be off for as long as the returned reference is used.
unsafe fn sched() -> &'static mut Sched {
    unsafe { &mut *SCHED.get_mut_raw() }
}

fn boot_thread() -> *mut Thread {
    BOOT_THREAD.get_mut_raw()
}

/// The running thread. The pointer is stable from the thread's own point of
/// view; reading it needs no critical section.
pub fn current() -> *mut Thread {
    // SAFETY: single word read; writers hold interrupts off.
    unsafe { (*SCHED.get_mut_raw()).current }
}

/// The policy selected at boot.
pub fn current_policy() -> Policy {
    // SAFETY: written once during init, read-mostly afterwards.
    unsafe { (*SCHED.get_mut_raw()).policy }
}

pub fn current_tid() -> usize {
    // SAFETY: the current thread cannot be reaped while it runs.
    unsafe { (*current()).tid }
}

pub fn current_name() -> ArrayString<NAME_MAX> {
    // SAFETY: as above.
    unsafe { (*current()).name }
}

/// Turn the boot context into thread 1 and select the policy.
pub fn init(policy: Policy) {
    let mut held = HeldInterrupts::new();
    let boot = BOOT_THREAD.get_mut_raw();
    // SAFETY: interrupts are off and nothing else refers to the block yet.
    unsafe {
        (*boot).tid = 1;
        (*boot).set_name("main");
        (*boot).status = Status::Running;
        let s = SCHED.borrow_mut(&mut held);
        s.policy = policy;
        s.current = boot;
        s.all.push_back(&mut (*boot).all_elem);
    }
}

/// Create the idle thread and start preemptive scheduling.
pub fn start() -> Result<()> {
    let idle = create_raw("idle", PRI_MIN, idle_thread, 0)?;
    {
        let mut held = HeldInterrupts::new();
        SCHED.borrow_mut(&mut held).idle = idle;
    }
    // SAFETY: the trap vector and timer are installed by now.
    unsafe { crate::riscv::intr_on() };
    Ok(())
}

extern "C" fn idle_thread(_: usize) {
    loop {
        crate::riscv::wfi();
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv64")] {
        core::arch::global_asm!(
            r#"
            # switch_threads(&mut cur.stack_ptr, &next.stack_ptr)
            #
            # Push ra and the callee-saved registers onto the outgoing
            # thread's stack, park sp in its control block, adopt the
            # incoming thread's sp, and pop. Pure assembly; the compiler
            # saves everything caller-saved around the call for us.
            .section .text
            .globl switch_threads
            switch_threads:
                addi sp, sp, -128
                sd ra, 0(sp)
                sd s0, 8(sp)
                sd s1, 16(sp)
                sd s2, 24(sp)
                sd s3, 32(sp)
                sd s4, 40(sp)
                sd s5, 48(sp)
                sd s6, 56(sp)
                sd s7, 64(sp)
                sd s8, 72(sp)
                sd s9, 80(sp)
                sd s10, 88(sp)
                sd s11, 96(sp)
                sd sp, 0(a0)
                ld sp, 0(a1)
                ld ra, 0(sp)
                ld s0, 8(sp)
                ld s1, 16(sp)
                ld s2, 24(sp)
                ld s3, 32(sp)
                ld s4, 40(sp)
                ld s5, 48(sp)
                ld s6, 56(sp)
                ld s7, 64(sp)
                ld s8, 72(sp)
                ld s9, 80(sp)
                ld s10, 88(sp)
                ld s11, 96(sp)
                addi sp, sp, 128
                ret

            # First switch into a new thread lands here with s0 = entry
            # function and s1 = its argument, interrupts off.
            .globl thread_trampoline
            thread_trampoline:
                call thread_trampoline_entry
                mv a0, s1
                jalr s0
                call thread_exit_entry
            "#
        );

        extern "C" {
            fn switch_threads(cur_sp: *mut usize, next_sp: *const usize);
            fn thread_trampoline();
        }

        fn trampoline_addr() -> usize {
            thread_trampoline as usize
        }

        unsafe fn do_switch(cur: *mut Thread, next: *mut Thread) {
            unsafe { switch_threads(&mut (*cur).stack_ptr, &(*next).stack_ptr) };
        }
    } else {
        fn trampoline_addr() -> usize {
            0
        }

        unsafe fn do_switch(_cur: *mut Thread, _next: *mut Thread) {
            unreachable!("context switching exists only on the target");
        }
    }
}

/// Runs in the brand-new thread before its entry function: finish the
/// switch, then enable interrupts for the first time.
#[no_mangle]
extern "C" fn thread_trampoline_entry() {
    schedule_tail();
    intr::reset_state();
    // SAFETY: threads run with interrupts on outside critical sections.
    unsafe { crate::riscv::intr_on() };
}

#[no_mangle]
extern "C" fn thread_exit_entry() {
    exit();
}

/// Allocate and initialize a thread without making it runnable.
fn create_raw(name: &str, priority: u32, f: ThreadFunc, arg: usize) -> Result<*mut Thread> {
    assert!(priority <= PRI_MAX);
    let page = kalloc::alloc_zeroed(PoolKind::Kernel).ok_or(KernelError::OutOfMemory)?;
    let pa = page.into_pa();
    let t = ptov(pa) as *mut Thread;

    // SAFETY: the page is fresh and pointer-aligned for Thread.
    unsafe {
        ptr::write(t, Thread::zeroed());
        (*t).tid = NEXT_TID.fetch_add(1, Ordering::Relaxed);
        (*t).set_name(name);
        (*t).priority = priority;
        (*t).effective_priority = priority;
        (*t).status = Status::Ready;

        // Fabricate the initial switch frame: popping it "returns" to the
        // trampoline with the entry function and argument in s0/s1.
        let stack_top = t as usize + PGSIZE;
        let ctx = (stack_top - CONTEXT_SIZE) as *mut Context;
        ptr::write(ctx, core::mem::zeroed());
        (*ctx).ra = trampoline_addr();
        (*ctx).s[0] = f as usize;
        (*ctx).s[1] = arg;
        (*t).stack_ptr = ctx as usize;
    }
    Ok(t)
}

/// Create a thread and put it on the ready queue. If it outranks the
/// running thread, yield to it right away.
pub fn create(name: &str, priority: u32, f: ThreadFunc, arg: usize) -> Result<usize> {
    assert!(!intr::in_interrupt_context());
    let t = create_raw(name, priority, f, arg)?;
    let (tid, preempt) = {
        let mut held = HeldInterrupts::new();
        let s = SCHED.borrow_mut(&mut held);
        // SAFETY: interrupts are off; t is fully initialized.
        unsafe {
            s.all.push_back(&mut (*t).all_elem);
            policy::on_unblock(s, t);
            s.ready.push_back(&mut (*t).elem);
            ((*t).tid, (*t).effective_priority > (*s.current).effective_priority)
        }
    };
    if preempt && intr_get() {
        yield_now();
    }
    Ok(tid)
}

/// Block the running thread. The caller must have disabled interrupts and
/// arranged for somebody to `unblock` it later.
pub fn block() {
    assert!(!intr_get(), "thread::block with interrupts on");
    assert!(!intr::in_interrupt_context());
    // SAFETY: interrupts are off.
    let s = unsafe { sched() };
    let cur = s.current;
    // SAFETY: current is live.
    unsafe {
        assert_eq!((*cur).status, Status::Running);
        (*cur).status = Status::Blocked;
    }
    schedule();
}

/// Make a blocked thread runnable. Legal from interrupt context; a handler
/// waking a higher-priority thread requests a yield instead of switching.
pub fn unblock(t: *mut Thread) {
    let mut held = HeldInterrupts::new();
    let s = SCHED.borrow_mut(&mut held);
    // SAFETY: interrupts are off and t is live (its owner blocked it).
    let preempt = unsafe {
        assert_eq!((*t).status, Status::Blocked, "unblock");
        (*t).status = Status::Ready;
        policy::on_unblock(s, t);
        s.ready.push_back(&mut (*t).elem);
        (*t).effective_priority > (*s.current).effective_priority
    };
    drop(held);
    if preempt {
        if intr::in_interrupt_context() {
            YIELD_REQUEST.store(true, Ordering::Relaxed);
        } else if intr_get() {
            yield_now();
        }
    }
}

/// Give up the hart, staying runnable.
pub fn yield_now() {
    assert!(!intr::in_interrupt_context());
    let mut held = HeldInterrupts::new();
    {
        let s = SCHED.borrow_mut(&mut held);
        let cur = s.current;
        // SAFETY: interrupts are off.
        unsafe {
            (*cur).status = Status::Ready;
            if cur != s.idle {
                s.ready.push_back(&mut (*cur).elem);
            }
        }
    }
    schedule();
    drop(held);
}

/// Terminate the running thread. Its page is reaped by `schedule_tail`
/// after the switch away from it.
pub fn exit() -> ! {
    assert!(!intr::in_interrupt_context());
    crate::riscv::intr_off();
    // SAFETY: interrupts are off.
    let s = unsafe { sched() };
    let cur = s.current;
    // SAFETY: current is live until the switch below.
    unsafe {
        List::remove(&mut (*cur).all_elem);
        (*cur).status = Status::Dying;
    }
    schedule();
    unreachable!("schedule returned to a dying thread");
}

/// Timer-tick hook: account the tick and ask for preemption when the slice
/// is used up. Runs from the timer interrupt.
pub fn tick() {
    // SAFETY: called with interrupts off from the interrupt handler.
    let s = unsafe { sched() };
    policy::on_tick(s);
    s.slice_ticks += 1;
    if s.slice_ticks >= TIME_SLICE {
        YIELD_REQUEST.store(true, Ordering::Relaxed);
    }
}

/// Consume a pending preemption request.
pub fn take_yield_request() -> bool {
    YIELD_REQUEST.swap(false, Ordering::Relaxed)
}

/// Change the running thread's base priority. The effective priority is
/// recomputed against any donations still held, then preemption is
/// re-evaluated.
pub fn set_priority(new: u32) {
    assert!(new <= PRI_MAX);
    let cur = current();
    {
        let mut held = HeldInterrupts::new();
        // SAFETY: interrupts off; cur is the running thread.
        unsafe { (*cur).priority = new };
        let eff = crate::sync::recompute_effective(cur, &mut held);
        // SAFETY: as above.
        unsafe { (*cur).effective_priority = eff };
    }
    policy::on_priority_change(cur);
}

pub fn current_priority() -> u32 {
    // SAFETY: the current thread cannot be reaped while it runs.
    unsafe { (*current()).priority }
}

pub fn current_effective_priority() -> u32 {
    // SAFETY: as above.
    unsafe { (*current()).effective_priority }
}

/// Re-evaluate the running thread against the ready queue after one of the
/// two changed; used by the priority-change hook.
pub fn maybe_preempt() {
    if intr::in_interrupt_context() {
        YIELD_REQUEST.store(true, Ordering::Relaxed);
        return;
    }
    let should = {
        let mut held = HeldInterrupts::new();
        let s = SCHED.borrow_mut(&mut held);
        match policy::peek_best(s) {
            // SAFETY: interrupts off, both threads live.
            Some(best) => unsafe {
                (*best).effective_priority > (*s.current).effective_priority
            },
            None => false,
        }
    };
    if should && intr_get() {
        yield_now();
    }
}

/// Pick and switch to the next thread. Interrupts must be off; the caller
/// has already taken `current` out of the RUNNING state.
fn schedule() {
    assert!(!intr_get(), "schedule with interrupts on");
    // SAFETY: interrupts are off.
    let s = unsafe { sched() };
    let cur = s.current;
    // SAFETY: cur is live; its magic word is at the stack-facing end.
    unsafe {
        assert_ne!((*cur).status, Status::Running, "schedule");
        assert_eq!((*cur).magic, STACK_MAGIC, "kernel stack overflow");
    }

    let next = policy::pick_next(s).unwrap_or(s.idle);
    assert!(!next.is_null(), "no runnable thread and no idle thread");
    // SAFETY: next came off the ready queue (or is idle), so it is live.
    unsafe { (*next).status = Status::Running };
    s.slice_ticks = 0;

    if next != cur {
        s.prev = cur;
        s.current = next;
        // The nesting bookkeeping belongs to the outgoing thread.
        let saved = intr::save_state();
        // SAFETY: both control blocks are live and their stacks disjoint.
        unsafe { do_switch(cur, next) };
        // We are back: some other thread switched to us.
        intr::restore_state(saved);
        schedule_tail();
    }
}

/// The tail of every switch, run in the incoming thread's context: activate
/// its address space, and free the previous thread if it was dying.
fn schedule_tail() {
    // SAFETY: interrupts are still off from schedule.
    let s = unsafe { sched() };
    let cur = s.current;
    let prev = core::mem::replace(&mut s.prev, ptr::null_mut());

    // SAFETY: cur is this thread.
    unsafe {
        match ((*cur).process).as_mut() {
            Some(proc) => proc.activate(),
            None => vm::activate_kernel(),
        }
    }

    if !prev.is_null() {
        // SAFETY: prev cannot run again before we release it here.
        unsafe {
            if (*prev).status == Status::Dying && prev != boot_thread() {
                let pa = vtop(prev as usize);
                kalloc::free(PoolKind::Kernel, Page::from_pa(pa));
            }
        }
    }
}

pub(crate) mod policy {
    //! The four disciplines behind one interface. `pick_next` removes and
    //! returns the queue's choice; `on_tick` accounts the running thread;
    //! `on_unblock` prepares a thread for requeueing; `on_priority_change`
    //! re-examines preemption after a donation or an explicit change.

    use super::*;

    /// Stride constant for the fair-share policy.
    const STRIDE1: u64 = 1 << 20;

    fn stride_of(t: *const Thread) -> u64 {
        // SAFETY: caller guarantees t is live.
        let pri = unsafe { (*t).effective_priority } as u64;
        STRIDE1 / (pri + 1)
    }

    pub(super) fn on_tick(s: &mut Sched) {
        let cur = s.current;
        match s.policy {
            Policy::Fifo | Policy::Priority => {}
            Policy::Mlfqs => {
                // SAFETY: current is live; interrupts are off.
                unsafe {
                    (*cur).recent_ticks += 1;
                    // Decay CPU hogs one priority level every eight ticks.
                    let penalty = ((*cur).recent_ticks / 8).min(PRI_MAX as u64) as u32;
                    (*cur).effective_priority = (*cur).priority.saturating_sub(penalty);
                }
            }
            Policy::FairShare => {
                // SAFETY: as above.
                unsafe { (*cur).pass = (*cur).pass.wrapping_add(stride_of(cur)) };
            }
        }
    }

    pub(super) fn on_unblock(s: &mut Sched, t: *mut Thread) {
        match s.policy {
            Policy::Fifo | Policy::Priority => {}
            Policy::Mlfqs => {
                // Sleeping wipes the recent-CPU penalty.
                // SAFETY: t is live; interrupts are off.
                unsafe {
                    (*t).recent_ticks = 0;
                    (*t).effective_priority = (*t).priority;
                }
            }
            Policy::FairShare => {
                // A waker must not monopolize: catch its pass value up to
                // the queue minimum.
                let floor = min_pass(&mut s.ready);
                // SAFETY: as above.
                unsafe { (*t).pass = (*t).pass.max(floor) };
            }
        }
    }

    /// A donation or explicit priority change happened to `t`.
    pub fn on_priority_change(_t: *mut Thread) {
        super::maybe_preempt();
    }

    pub(super) fn pick_next(s: &mut Sched) -> Option<*mut Thread> {
        select_next(s.policy, &mut s.ready)
    }

    /// The thread `pick_next` would choose, left on the queue.
    pub(super) fn peek_best(s: &mut Sched) -> Option<*mut Thread> {
        peek(s.policy, &mut s.ready)
    }

    fn min_pass(ready: &mut List) -> u64 {
        let mut best = 0;
        let mut first = true;
        let mut e = ready.front();
        while let Some(entry) = e {
            let t = container_of!(entry, Thread, elem);
            // SAFETY: ready entries are live threads.
            let pass = unsafe { (*t).pass };
            if first || pass < best {
                best = pass;
                first = false;
            }
            e = ready.next_of(entry);
        }
        best
    }

    /// Scan for the queue's best entry. Ties resolve to the earliest
    /// insertion, which makes equal-priority scheduling round-robin.
    fn peek(policy: Policy, ready: &mut List) -> Option<*mut Thread> {
        let mut best: Option<*mut ListEntry> = None;
        let mut e = ready.front();
        while let Some(entry) = e {
            let better = match (policy, best) {
                (Policy::Fifo, None) => true,
                (Policy::Fifo, Some(_)) => false,
                (_, None) => true,
                (Policy::Priority | Policy::Mlfqs, Some(b)) => {
                    let t = container_of!(entry, Thread, elem);
                    let bt = container_of!(b, Thread, elem);
                    // SAFETY: ready entries are live threads.
                    unsafe { (*t).effective_priority > (*bt).effective_priority }
                }
                (Policy::FairShare, Some(b)) => {
                    let t = container_of!(entry, Thread, elem);
                    let bt = container_of!(b, Thread, elem);
                    // SAFETY: as above.
                    unsafe { (*t).pass < (*bt).pass }
                }
            };
            if better {
                best = Some(entry);
            }
            e = ready.next_of(entry);
        }
        best.map(|e| container_of!(e, Thread, elem))
    }

    pub(crate) fn select_next(policy: Policy, ready: &mut List) -> Option<*mut Thread> {
        let t = peek(policy, ready)?;
        // SAFETY: t is on the ready queue via elem.
        unsafe { List::remove(&mut (*t).elem) };
        Some(t)
    }
}

#[cfg(test)]
mod tests {
    use super::policy::select_next;
    use super::*;

    fn make(pri: u32, pass: u64) -> Box<Thread> {
        let mut t = Box::new(Thread::zeroed());
        t.priority = pri;
        t.effective_priority = pri;
        t.pass = pass;
        t
    }

    // A list self-links through its head, so it is filled in place rather
    // than returned by value.
    fn fill(ready: &mut List, threads: &mut [Box<Thread>]) {
        for t in threads {
            unsafe { ready.push_back(&mut t.elem) };
        }
    }

    #[test]
    fn fifo_picks_in_arrival_order() {
        let mut ts = vec![make(5, 0), make(50, 0), make(1, 0)];
        let mut ready = List::new();
        fill(&mut ready, &mut ts);
        let order: Vec<u32> = (0..3)
            .map(|_| unsafe { (*select_next(Policy::Fifo, &mut ready).unwrap()).priority })
            .collect();
        assert_eq!(order, [5, 50, 1]);
        assert!(select_next(Policy::Fifo, &mut ready).is_none());
    }

    #[test]
    fn priority_picks_max_with_fifo_ties() {
        let mut ts = vec![make(10, 0), make(30, 0), make(30, 0), make(20, 0)];
        let second_ptr: *mut Thread = ts[1].as_mut();
        let mut ready = List::new();
        fill(&mut ready, &mut ts);
        let first = select_next(Policy::Priority, &mut ready).unwrap();
        // Of the two priority-30 threads, the earlier insertion wins.
        assert_eq!(first, second_ptr);
        let next = select_next(Policy::Priority, &mut ready).unwrap();
        assert_eq!(unsafe { (*next).effective_priority }, 30);
        let next = select_next(Policy::Priority, &mut ready).unwrap();
        assert_eq!(unsafe { (*next).effective_priority }, 20);
    }

    #[test]
    fn fair_share_picks_min_pass() {
        let mut ts = vec![make(31, 300), make(31, 100), make(31, 200)];
        let mut ready = List::new();
        fill(&mut ready, &mut ts);
        let order: Vec<u64> = (0..3)
            .map(|_| unsafe { (*select_next(Policy::FairShare, &mut ready).unwrap()).pass })
            .collect();
        assert_eq!(order, [100, 200, 300]);
    }

    #[test]
    fn name_truncates_to_fifteen() {
        let mut t = Thread::zeroed();
        t.set_name("a-very-long-thread-name");
        assert_eq!(t.name.len(), NAME_MAX - 1);
        assert_eq!(&t.name[..], "a-very-long-thr");
    }

    #[test]
    fn policy_names() {
        assert_eq!(Policy::from_name("fifo"), Some(Policy::Fifo));
        assert_eq!(Policy::from_name("prio"), Some(Policy::Priority));
        assert_eq!(Policy::from_name("mlfqs"), Some(Policy::Mlfqs));
        assert_eq!(Policy::from_name("fair"), Some(Policy::FairShare));
        assert_eq!(Policy::from_name("rr"), None);
    }
}
