//! Interrupt-disabling locks for short critical sections.
//!
//! On a single hart a held lock can never be observed contended: acquisition
//! disables interrupts, so the only way to reach `acquire` while the lock is
//! held is a bug. The held flag exists for exactly that assertion.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::intr::{pop_off, push_off};

/// Mutual exclusion by interrupt disabling.
pub struct RawSpinlock {
    /// Name of lock, for assertions.
    name: &'static str,

    locked: AtomicBool,
}

impl RawSpinlock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
        }
    }

    pub fn acquire(&self) {
        push_off();
        // On the target this loop never spins: interrupts are off and there
        // is one hart, so the lock cannot be held here unless re-acquired by
        // its own holder, which the release assertion would have caught.
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    pub fn release(&self) {
        assert!(self.holding(), "release {}", self.name);
        self.locked.store(false, Ordering::Release);
        pop_off();
    }

    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// A lock that owns its data. The data is accessible only through a guard.
pub struct Spinlock<T> {
    lock: RawSpinlock,
    data: UnsafeCell<T>,
}

// SAFETY: access to the inner data requires holding the lock.
unsafe impl<T: Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSpinlock::new(name),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        self.lock.acquire();
        SpinlockGuard { inner: self }
    }

    /// Returns a raw pointer to the inner data without locking. The caller
    /// must ensure no race, e.g. on the panic path when the machine is
    /// single-threaded by fiat.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }
}

pub struct SpinlockGuard<'s, T> {
    inner: &'s Spinlock<T>,
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.inner.data.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the guard holds the lock exclusively.
        unsafe { &mut *self.inner.data.get() }
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.inner.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_guards_data() {
        let lock = Spinlock::new("test", 41);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 42);
    }

    #[test]
    fn relock_after_release() {
        let lock = Spinlock::new("test", ());
        drop(lock.lock());
        drop(lock.lock());
    }
}
