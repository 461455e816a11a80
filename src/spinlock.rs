//! Spin-lock primitive.
//!
//! A real spin-lock also disables interrupts for its holder so it can't be
//! preempted mid-critical-section; that bracket needs a real interrupt
//! controller and is left out here. What's left — mutual exclusion via
//! busy-waiting, released in pairs, never held across a sleep — is the part
//! both subsystems depend on, so it is implemented directly as a concrete
//! `SpinLock<T>` rather than pushed behind a trait.

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A lock that spins rather than blocking while waiting.
///
/// Never hold a `SpinLock` across an operation that may sleep (disk I/O,
/// [`crate::sleeplock::SleepLock`] acquisition) — both subsystems in this
/// crate rely on that discipline to avoid deadlock.
#[derive(Debug)]
pub struct SpinLock<T> {
    _name: &'static str,
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// Safety: the lock hands out `&mut T` to exactly one holder at a time, so
// sharing `SpinLock<T>` across threads is safe whenever `T: Send`.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T, name: &'static str) -> Self {
        Self {
            _name: name,
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
        SpinLockGuard { lock: self }
    }

    /// Borrows the protected value without locking.
    ///
    /// Only safe to call where no other thread can be holding the lock,
    /// e.g. during single-threaded construction.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutual_exclusion_under_contention() {
        let lock = std::sync::Arc::new(SpinLock::new(0usize, "counter"));
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let lock = std::sync::Arc::clone(&lock);
                scope.spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                });
            }
        });
        assert_eq!(*lock.lock(), 8000);
    }

    #[test]
    fn guard_releases_on_drop() {
        let lock = SpinLock::new(1, "x");
        {
            let mut guard = lock.lock();
            *guard = 2;
        }
        assert_eq!(*lock.lock(), 2);
    }
}
