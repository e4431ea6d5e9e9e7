//! Spin-based mutual exclusion for VMX-root-capable code.
//!
//! VMX-root code cannot block and must not be preempted, so the guard
//! masks maskable interrupts for its lifetime in addition to holding the
//! lock word. NMIs can still arrive; the halt protocol is the only NMI
//! consumer and never takes these locks re-entrantly.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

#[inline(always)]
fn interrupts_enabled() -> bool {
    #[cfg(not(test))]
    {
        vtx::regs::Rflags::read().contains(vtx::regs::Rflags::IF)
    }
    #[cfg(test)]
    {
        false
    }
}

#[inline(always)]
fn cli() {
    #[cfg(not(test))]
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack));
    }
}

#[inline(always)]
fn sti() {
    #[cfg(not(test))]
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack));
    }
}

/// A spinlock whose guard keeps interrupts masked.
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

/// RAII guard; dropping it releases the lock and restores the interrupt
/// state captured at acquisition.
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    reenable_interrupts: bool,
}

impl<T> SpinLock<T> {
    /// Wrap a value.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Consume the lock, returning the inner value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquire, spinning as needed.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let reenable_interrupts = interrupts_enabled();
        cli();
        while self.locked.swap(true, Ordering::Acquire) {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
        SpinLockGuard {
            lock: self,
            reenable_interrupts,
        }
    }

    /// Try to acquire without spinning.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let reenable_interrupts = interrupts_enabled();
        cli();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard {
                lock: self,
                reenable_interrupts,
            })
        } else {
            if reenable_interrupts {
                sti();
            }
            None
        }
    }

    /// Access the value with no locking.
    ///
    /// # Safety
    /// The caller must guarantee exclusion by other means, e.g. all peer
    /// cores halted in the NMI spin.
    pub unsafe fn force_get_mut(&self) -> &mut T {
        &mut *self.value.get()
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        if self.reenable_interrupts {
            sti();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn exclusion_across_threads() {
        let counter = Arc::new(SpinLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    *counter.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock(), 8000);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }
}
