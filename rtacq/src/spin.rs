//! Busy-wait mutual exclusion built on [`AtomicWord::test_and_set`].
//!
//! The lock never parks the thread. It is meant for critical sections of
//! bounded, short duration such as advancing a ring index or copying one
//! slot; anything longer belongs outside the lock.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::AtomicU32;

use crate::atomic::AtomicWord;

/// Spin hints issued between two failed acquisition attempts before the
/// thread yields its execution unit.
pub const SPIN_PAUSE_ITERATIONS: u32 = 64;

/// A spin lock guarding a value of type `T`.
///
/// `SpinLock<()>` is a bare lock word.
pub struct SpinLock<T: ?Sized = ()> {
    word: AtomicU32,
    value: UnsafeCell<T>,
}

// SAFETY: The lock word serializes all access to `value`; a guard is the only
// way to reach it and at most one guard exists at a time.
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}

// SAFETY: As above; sharing the lock only shares the ability to acquire it.
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates an unlocked spin lock around `value`.
    pub const fn new(value: T) -> Self {
        Self {
            word: AtomicU32::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Consumes the lock and returns the guarded value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Spins until the lock is acquired.
    ///
    /// Between attempts the caller pauses for [`SPIN_PAUSE_ITERATIONS`] spin
    /// hints and then yields, so a holder preempted on the same execution
    /// unit gets to run and release.
    pub fn acquire(&self) -> SpinGuard<'_, T> {
        while !self.word.test_and_set() {
            for _ in 0..SPIN_PAUSE_ITERATIONS {
                std::hint::spin_loop();
            }
            std::thread::yield_now();
        }
        SpinGuard { lock: self }
    }

    /// Makes a single acquisition attempt.
    pub fn try_acquire(&self) -> Option<SpinGuard<'_, T>> {
        if self.word.test_and_set() {
            Some(SpinGuard { lock: self })
        } else {
            None
        }
    }

    /// Returns whether the lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.word.value() != 0
    }

    /// Returns a mutable reference to the value without locking.
    ///
    /// Exclusive borrow of the lock proves no guard exists.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    fn release(&self) {
        self.word.exchange(0);
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// RAII guard; releases the lock on drop.
pub struct SpinGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard exists only while this thread holds the lock.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard exists only while this thread holds the lock, and
        // `&mut self` prevents aliasing through the same guard.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T: ?Sized> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_try_acquire_fails_while_held() {
        let lock = SpinLock::new(0u32);

        let guard = lock.acquire();
        assert!(lock.is_locked());
        assert!(lock.try_acquire().is_none());
        drop(guard);

        assert!(!lock.is_locked());
        assert!(lock.try_acquire().is_some());
    }

    #[test]
    fn test_guard_gives_access_to_value() {
        let lock = SpinLock::new(vec![1, 2, 3]);
        lock.acquire().push(4);
        assert_eq!(*lock.acquire(), vec![1, 2, 3, 4]);
        assert_eq!(lock.into_inner().len(), 4);
    }

    #[test]
    fn test_contended_increments_are_not_lost() {
        let lock = Arc::new(SpinLock::new(0u64));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                std::thread::spawn(move || {
                    for _ in 0..5_000 {
                        *lock.acquire() += 1;
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(*lock.acquire(), 20_000);
    }

    #[test]
    fn test_acquire_waits_for_release() {
        let lock = Arc::new(SpinLock::new(()));
        let guard = lock.acquire();

        let waiter = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                let _g = lock.acquire();
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.join().unwrap();
        assert!(!lock.is_locked());
    }
}
