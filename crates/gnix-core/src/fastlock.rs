//! Spinning lock guarding provider hot-path state
//!
//! Used for the event queue lists and the NIC lock that also guards VC
//! state. Critical sections are short (copy-under-lock), so spinning beats
//! parking here.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Test-and-test-and-set lock with bounded backoff
pub struct FastLock<T> {
    held: AtomicBool,
    /// Number of acquisitions that had to spin
    contended: AtomicU64,
    value: UnsafeCell<T>,
}

// Safety: FastLock hands out at most one guard at a time
unsafe impl<T: Send> Send for FastLock<T> {}
unsafe impl<T: Send> Sync for FastLock<T> {}

impl<T> FastLock<T> {
    pub const fn new(value: T) -> Self {
        FastLock {
            held: AtomicBool::new(false),
            contended: AtomicU64::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire, spinning until the holder releases
    #[inline]
    pub fn acquire(&self) -> FastLockGuard<'_, T> {
        if self.try_grab() {
            return FastLockGuard { lock: self };
        }
        self.contended.fetch_add(1, Ordering::Relaxed);

        let mut backoff = 1u32;
        loop {
            while self.held.load(Ordering::Relaxed) {
                for _ in 0..backoff {
                    core::hint::spin_loop();
                }
                backoff = (backoff << 1).min(64);
            }
            if self.try_grab() {
                return FastLockGuard { lock: self };
            }
        }
    }

    /// Acquire without spinning
    #[inline]
    pub fn try_acquire(&self) -> Option<FastLockGuard<'_, T>> {
        if self.try_grab() {
            Some(FastLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Run `f` with the lock held
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.acquire();
        f(&mut guard)
    }

    #[inline]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }

    pub fn contended_count(&self) -> u64 {
        self.contended.load(Ordering::Relaxed)
    }

    /// Exclusive access through `&mut self`; no locking needed.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }

    #[inline]
    fn try_grab(&self) -> bool {
        self.held
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

impl<T: Default> Default for FastLock<T> {
    fn default() -> Self {
        FastLock::new(T::default())
    }
}

/// Releases the lock on drop
pub struct FastLockGuard<'a, T> {
    lock: &'a FastLock<T>,
}

impl<T> Deref for FastLockGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: the guard proves exclusive ownership
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for FastLockGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves exclusive ownership
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for FastLockGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_acquire_and_release() {
        let lock = FastLock::new(Vec::new());
        lock.acquire().push(1u32);
        lock.with(|v| v.push(2));
        assert_eq!(*lock.acquire(), vec![1, 2]);
        assert!(!lock.is_held());
    }

    #[test]
    fn test_try_acquire_while_held() {
        let lock = FastLock::new(0u8);
        let guard = lock.acquire();
        assert!(lock.try_acquire().is_none());
        drop(guard);
        assert!(lock.try_acquire().is_some());
    }

    #[test]
    fn test_many_writers() {
        let lock = Arc::new(FastLock::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..2000 {
                        *lock.acquire() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.acquire(), 8000);
    }
}
