//! Interrupt-safe locks.
//!
//! [`IrqMutex`] disables interrupts for the duration of the critical
//! section, which is what makes kernel data safe to touch from both
//! syscall and interrupt context on a single-CPU kernel. A ticket
//! discipline keeps acquisition FIFO. [`IrqRwLock`] wraps the spin
//! crate's reader-writer lock with the same interrupt guard.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU16, Ordering};

#[inline]
fn irq_save_and_disable() -> bool {
    #[cfg(target_os = "none")]
    {
        let enabled = x86_64::instructions::interrupts::are_enabled();
        x86_64::instructions::interrupts::disable();
        enabled
    }
    #[cfg(not(target_os = "none"))]
    {
        false
    }
}

#[inline]
fn irq_restore(enabled: bool) {
    #[cfg(target_os = "none")]
    if enabled {
        x86_64::instructions::interrupts::enable();
    }
    #[cfg(not(target_os = "none"))]
    let _ = enabled;
}

pub struct IrqMutex<T> {
    next_ticket: AtomicU16,
    now_serving: AtomicU16,
    data: UnsafeCell<T>,
}

// SAFETY: exclusive access is guaranteed by ticket acquisition with
// interrupts disabled while the guard lives.
unsafe impl<T: Send> Send for IrqMutex<T> {}
unsafe impl<T: Send> Sync for IrqMutex<T> {}

pub struct IrqMutexGuard<'a, T> {
    mutex: &'a IrqMutex<T>,
    saved_irq: bool,
}

impl<T> IrqMutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            next_ticket: AtomicU16::new(0),
            now_serving: AtomicU16::new(0),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let saved_irq = irq_save_and_disable();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != ticket {
            spin_loop();
        }
        IrqMutexGuard {
            mutex: self,
            saved_irq,
        }
    }
}

impl<T> Deref for IrqMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for IrqMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock exclusively.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for IrqMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.now_serving.fetch_add(1, Ordering::Release);
        irq_restore(self.saved_irq);
    }
}

pub struct IrqRwLock<T> {
    inner: spin::RwLock<T>,
}

pub struct IrqRwLockReadGuard<'a, T> {
    guard: ManuallyDrop<spin::RwLockReadGuard<'a, T>>,
    saved_irq: bool,
}

pub struct IrqRwLockWriteGuard<'a, T> {
    guard: ManuallyDrop<spin::RwLockWriteGuard<'a, T>>,
    saved_irq: bool,
}

impl<T> IrqRwLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            inner: spin::RwLock::new(data),
        }
    }

    pub fn read(&self) -> IrqRwLockReadGuard<'_, T> {
        let saved_irq = irq_save_and_disable();
        IrqRwLockReadGuard {
            guard: ManuallyDrop::new(self.inner.read()),
            saved_irq,
        }
    }

    pub fn write(&self) -> IrqRwLockWriteGuard<'_, T> {
        let saved_irq = irq_save_and_disable();
        IrqRwLockWriteGuard {
            guard: ManuallyDrop::new(self.inner.write()),
            saved_irq,
        }
    }
}

impl<T> Deref for IrqRwLockReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> Drop for IrqRwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        // Release the lock before re-enabling interrupts.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        irq_restore(self.saved_irq);
    }
}

impl<T> Deref for IrqRwLockWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqRwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for IrqRwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        irq_restore(self.saved_irq);
    }
}
