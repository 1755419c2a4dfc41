//! Interrupt-disable discipline.
//!
//! Short critical sections on scheduler structures, the sleep list, and the
//! free-frame lists are protected by turning supervisor interrupts off. The
//! single hart means nothing else can touch the data while they are off.
//!
//! `push_off`/`pop_off` are like `intr_off`/`intr_on` except that they are
//! matched: it takes two `pop_off`s to undo two `push_off`s, and if
//! interrupts were off to begin with they stay off.

use crate::riscv::{intr_get, intr_off, intr_on};

cfg_if::cfg_if! {
    if #[cfg(test)] {
        // Host tests run concurrently; each test thread carries its own
        // nesting state, matching the thread-local CSR shims.
        use core::cell::Cell;

        std::thread_local! {
            static NOFF: Cell<i32> = const { Cell::new(0) };
            static ENABLED_BEFORE: Cell<bool> = const { Cell::new(false) };
            static TRAP_DEPTH: Cell<usize> = const { Cell::new(0) };
        }

        fn noff() -> i32 {
            NOFF.with(Cell::get)
        }

        fn set_noff(v: i32) {
            NOFF.with(|c| c.set(v));
        }

        fn enabled_before() -> bool {
            ENABLED_BEFORE.with(Cell::get)
        }

        fn set_enabled_before(v: bool) {
            ENABLED_BEFORE.with(|c| c.set(v));
        }

        fn trap_depth() -> usize {
            TRAP_DEPTH.with(Cell::get)
        }

        fn set_trap_depth(v: usize) {
            TRAP_DEPTH.with(|c| c.set(v));
        }
    } else {
        use core::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

        /// Depth of push_off() nesting.
        static NOFF: AtomicI32 = AtomicI32::new(0);

        /// Were interrupts enabled before the outermost push_off()?
        static ENABLED_BEFORE: AtomicBool = AtomicBool::new(false);

        /// Depth of interrupt handling. Nonzero exactly while a hardware
        /// interrupt (not an exception or syscall) is being dispatched.
        static TRAP_DEPTH: AtomicUsize = AtomicUsize::new(0);

        fn noff() -> i32 {
            NOFF.load(Ordering::Relaxed)
        }

        fn set_noff(v: i32) {
            NOFF.store(v, Ordering::Relaxed);
        }

        fn enabled_before() -> bool {
            ENABLED_BEFORE.load(Ordering::Relaxed)
        }

        fn set_enabled_before(v: bool) {
            ENABLED_BEFORE.store(v, Ordering::Relaxed);
        }

        fn trap_depth() -> usize {
            TRAP_DEPTH.load(Ordering::Relaxed)
        }

        fn set_trap_depth(v: usize) {
            TRAP_DEPTH.store(v, Ordering::Relaxed);
        }
    }
}

pub fn push_off() {
    let old = intr_get();
    intr_off();

    if noff() == 0 {
        set_enabled_before(old);
    }
    set_noff(noff() + 1);
}

pub fn pop_off() {
    assert!(!intr_get(), "pop_off - interruptible");
    let n = noff();
    assert!(n >= 1, "pop_off");

    set_noff(n - 1);
    if n == 1 && enabled_before() {
        // SAFETY: no critical section remains open.
        unsafe { intr_on() };
    }
}

/// RAII guard for a critical section.
///
/// # Safety invariant
///
/// While any `HeldInterrupts` exists, supervisor interrupts are off, so
/// no preemption can observe the protected state mid-update.
pub struct HeldInterrupts {
    _not_send: core::marker::PhantomData<*mut ()>,
}

impl HeldInterrupts {
    pub fn new() -> Self {
        push_off();
        Self {
            _not_send: core::marker::PhantomData,
        }
    }
}

impl Default for HeldInterrupts {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HeldInterrupts {
    fn drop(&mut self) {
        pop_off();
    }
}

/// True while a hardware interrupt handler is running. Code that may block
/// asserts this is false before reaching a suspension point.
pub fn in_interrupt_context() -> bool {
    trap_depth() > 0
}

/// Bracket an interrupt dispatch. Called only by the trap dispatcher.
pub(crate) fn enter_interrupt() {
    set_trap_depth(trap_depth() + 1);
}

pub(crate) fn leave_interrupt() {
    let depth = trap_depth();
    debug_assert!(depth > 0);
    set_trap_depth(depth - 1);
}

/// Snapshot of the push_off nesting, carried across context switches: the
/// pairing belongs to a thread, not to the hart.
#[derive(Clone, Copy, Default)]
pub(crate) struct SavedState {
    noff: i32,
    enabled_before: bool,
}

pub(crate) fn save_state() -> SavedState {
    SavedState {
        noff: noff(),
        enabled_before: enabled_before(),
    }
}

pub(crate) fn restore_state(state: SavedState) {
    set_noff(state.noff);
    set_enabled_before(state.enabled_before);
}

/// A brand-new thread starts with no critical section open. Called once
/// from the first-switch trampoline before interrupts come on.
pub(crate) fn reset_state() {
    set_noff(0);
    set_enabled_before(false);
}

/// A process-wide singleton mutated only with interrupts off.
///
/// The documented lifecycle of each such global is init-then-read-mostly;
/// interrupt-context accessors must wrap any mutation in a `HeldInterrupts`.
#[repr(transparent)]
pub struct IntrCell<T> {
    inner: core::cell::UnsafeCell<T>,
}

// SAFETY: access requires a HeldInterrupts, and there is a single hart, so
// no two accesses race. The raw pointers these cells routinely hold never
// leave the kernel address space.
unsafe impl<T> Sync for IntrCell<T> {}

impl<T> IntrCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: core::cell::UnsafeCell::new(value),
        }
    }

    /// Borrow the contents for the duration of a critical section. The
    /// exclusive borrow of the guard keeps a second borrow from aliasing.
    #[allow(clippy::mut_from_ref)]
    pub fn borrow_mut<'a>(&'a self, _held: &'a mut HeldInterrupts) -> &'a mut T {
        // SAFETY: interrupts are off and the guard is exclusively borrowed.
        unsafe { &mut *self.inner.get() }
    }

    /// Raw access for code that manages its own interrupt state.
    pub fn get_mut_raw(&self) -> *mut T {
        self.inner.get()
    }
}

/// Pintos-style level interface, used where saving a guard is awkward.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Level {
    On,
    Off,
}

/// Disable interrupts and report the previous level.
pub fn disable() -> Level {
    let old = if intr_get() { Level::On } else { Level::Off };
    intr_off();
    old
}

/// Restore a previously reported level.
pub fn set_level(level: Level) {
    match level {
        // SAFETY: the caller observed interrupts enabled at this level.
        Level::On => unsafe { intr_on() },
        Level::Off => intr_off(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_pairing() {
        // Start from a known state: interrupts on.
        unsafe { intr_on() };
        push_off();
        assert!(!intr_get());
        push_off();
        pop_off();
        // Inner pop must not re-enable.
        assert!(!intr_get());
        pop_off();
        assert!(intr_get());
    }

    #[test]
    fn guard_restores_prior_state() {
        intr_off();
        {
            let _g = HeldInterrupts::new();
            assert!(!intr_get());
        }
        // Interrupts were off before the guard; they stay off.
        assert!(!intr_get());
        unsafe { intr_on() };
        {
            let _g = HeldInterrupts::new();
            assert!(!intr_get());
        }
        assert!(intr_get());
    }
}
