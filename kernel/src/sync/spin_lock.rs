use core::{
    cell::UnsafeCell,
    hint,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

struct RawSpinLock {
    locked: AtomicBool,
}

impl RawSpinLock {
    const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Acquires the lock.
    ///
    /// Loops (spins) until the lock is acquired.
    fn acquire(&self) {
        // `Ordering::Acquire` tells the compiler and the processor to not
        // move loads or stores past this point, so that the critical
        // section's memory references happen strictly after the lock is
        // acquired. On RISC-V, this emits a fence instruction.
        while self.locked.swap(true, Ordering::Acquire) {
            hint::spin_loop();
        }
    }

    /// Releases the lock.
    fn release(&self) {
        // `Ordering::Release` tells the compiler and the CPU to not move
        // loads or stores past this point, so that all stores in the
        // critical section are visible to other CPUs before the lock is
        // released. On RISC-V, this emits a fence instruction.
        self.locked.store(false, Ordering::Release);
    }
}

/// A spinning mutex.
///
/// Holders must not sleep; the memory core only takes it around free-list
/// link updates, never across a frame fill or a page-table walk.
pub struct SpinLock<T> {
    lock: RawSpinLock,
    value: UnsafeCell<T>,
}

unsafe impl<T> Sync for SpinLock<T> where T: Send {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            lock: RawSpinLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock.
    ///
    /// Loops (spins) until the lock is acquired.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.lock.acquire();
        SpinLockGuard { lock: self }
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

unsafe impl<T> Send for SpinLockGuard<'_, T> where T: Send {}
unsafe impl<T> Sync for SpinLockGuard<'_, T> where T: Sync {}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}
