// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Interrupt-masking spin lock for kernel singletons
//! OWNERS: @kernel-sync-team
//! PUBLIC API: SpinLock, SpinLockGuard, irq::*
//! DEPENDS_ON: core atomics; platform IrqOps (see `irq`)
//! INVARIANTS: Not reentrant; interrupts stay masked while a guard is alive;
//!             the flag is cleared before interrupts are unmasked

#![cfg_attr(not(test), no_std)]

pub mod irq;

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use irq::IrqGuard;

const NO_OWNER: usize = usize::MAX;

/// A test-and-set spin lock that masks interrupts on the owning processor.
///
/// Recursive acquisition on one processor deadlocks. Debug builds with
/// installed interrupt hooks turn that into a panic instead.
pub struct SpinLock<T: ?Sized> {
    flag: AtomicBool,
    owner: AtomicUsize,
    value: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            flag: AtomicBool::new(false),
            owner: AtomicUsize::new(NO_OWNER),
            value: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let irq = IrqGuard::new();
        self.assert_not_owner();
        while self
            .flag
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.flag.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
        self.claim();
        SpinLockGuard { lock: self, _irq: irq }
    }

    /// Single acquisition attempt; never spins.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let irq = IrqGuard::new();
        if self
            .flag
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.claim();
            Some(SpinLockGuard { lock: self, _irq: irq })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    fn assert_not_owner(&self) {
        if cfg!(debug_assertions) && irq::installed() {
            let me = irq::cpu_id();
            assert!(
                self.owner.load(Ordering::Relaxed) != me,
                "spinlock: recursive acquisition on cpu {me}"
            );
        }
    }

    fn claim(&self) {
        if irq::installed() {
            self.owner.store(irq::cpu_id(), Ordering::Relaxed);
        }
    }

    fn unlock(&self) {
        self.owner.store(NO_OWNER, Ordering::Relaxed);
        self.flag.store(false, Ordering::Release);
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("SpinLock").field("value", &&*guard).finish(),
            None => f.write_str("SpinLock { <locked> }"),
        }
    }
}

/// Ownership token; dropping it releases the flag, then the interrupt mask.
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    _irq: IrqGuard,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::SpinLock;

    #[test]
    fn guard_provides_mut_access() {
        let lock = SpinLock::new(1_u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 2);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(());
        let held = lock.lock();
        assert!(lock.is_locked());
        assert!(lock.try_lock().is_none());
        drop(held);
        assert!(lock.try_lock().is_some());
        assert!(!lock.is_locked());
    }

    #[test]
    fn debug_reports_locked_state() {
        let lock = SpinLock::new(7_u8);
        assert_eq!(format!("{lock:?}"), "SpinLock { value: 7 }");
        let _held = lock.lock();
        assert_eq!(format!("{lock:?}"), "SpinLock { <locked> }");
    }
}
