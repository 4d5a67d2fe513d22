//! Global execution lock
//!
//! One lock serializes every dispatched callback against concurrently
//! running CPU/worker threads. The loop thread holds it for a whole
//! iteration and lets go only across the single blocking wait, through
//! [`BigLockGuard::unlocked`], which re-acquires on every exit path
//! including unwinding.
//!
//! ```ignore
//! let lock = BigLock::new();
//! let mut guard = lock.lock();
//! let ready = guard.unlocked(|| wait_for_events(timeout));
//! // lock held again here, whatever `wait_for_events` did
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// The global execution lock
pub struct BigLock {
    mutex: Mutex<()>,
    locked: AtomicBool,
}

impl BigLock {
    pub const fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            locked: AtomicBool::new(false),
        }
    }

    fn acquire(&self) -> MutexGuard<'_, ()> {
        // A panicking callback must not wedge every other thread.
        let g = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        self.locked.store(true, Ordering::Release);
        g
    }

    /// Acquire the lock, blocking the OS thread until available
    pub fn lock(&self) -> BigLockGuard<'_> {
        BigLockGuard {
            lock: self,
            inner: Some(self.acquire()),
        }
    }

    /// Try to acquire the lock without blocking
    pub fn try_lock(&self) -> Option<BigLockGuard<'_>> {
        let g = match self.mutex.try_lock() {
            Ok(g) => g,
            Err(std::sync::TryLockError::Poisoned(p)) => p.into_inner(),
            Err(std::sync::TryLockError::WouldBlock) => return None,
        };
        self.locked.store(true, Ordering::Release);
        Some(BigLockGuard { lock: self, inner: Some(g) })
    }

    /// Whether some thread holds the lock (hint, may be stale)
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Whether `guard` was taken from this lock
    #[inline]
    pub fn owns(&self, guard: &BigLockGuard<'_>) -> bool {
        std::ptr::eq(self, guard.lock)
    }
}

impl Default for BigLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BigLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Proof that the global execution lock is held
pub struct BigLockGuard<'a> {
    lock: &'a BigLock,
    inner: Option<MutexGuard<'a, ()>>,
}

impl<'a> BigLockGuard<'a> {
    /// Release the lock, run `f`, and re-acquire before returning.
    ///
    /// The re-acquire also happens if `f` unwinds.
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        struct Relock<'g, 'a> {
            guard: &'g mut BigLockGuard<'a>,
        }

        impl Drop for Relock<'_, '_> {
            fn drop(&mut self) {
                self.guard.inner = Some(self.guard.lock.acquire());
            }
        }

        self.release();
        let _relock = Relock { guard: self };
        f()
    }

    fn release(&mut self) {
        if let Some(g) = self.inner.take() {
            self.lock.locked.store(false, Ordering::Release);
            drop(g);
        }
    }

    /// The lock this guard belongs to
    #[inline]
    pub fn lock_ref(&self) -> &'a BigLock {
        self.lock
    }
}

impl Drop for BigLockGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_lock_unlock() {
        let lock = BigLock::new();
        {
            let _g = lock.lock();
            assert!(lock.is_locked());
            assert!(lock.try_lock().is_none());
        }
        assert!(!lock.is_locked());
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_unlocked_lets_other_threads_in() {
        let lock = Arc::new(BigLock::new());
        let mut guard = lock.lock();

        let other = Arc::clone(&lock);
        let ran = guard.unlocked(|| {
            thread::spawn(move || {
                let _g = other.lock();
                true
            })
            .join()
            .unwrap()
        });

        assert!(ran);
        assert!(lock.is_locked());
        assert!(lock.try_lock().is_none());
    }

    #[test]
    fn test_relock_on_unwind() {
        let lock = BigLock::new();
        let mut guard = lock.lock();

        let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            guard.unlocked(|| panic!("boom"));
        }));
        assert!(r.is_err());
        assert!(lock.is_locked());
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_workers_serialize_on_lock() {
        let lock = Arc::new(BigLock::new());
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut guard = lock.lock();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    let _g = lock.lock();
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        guard.unlocked(|| {
            for h in handles {
                h.join().unwrap();
            }
        });
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_owns() {
        let a = BigLock::new();
        let b = BigLock::new();
        let g = a.lock();
        assert!(a.owns(&g));
        assert!(!b.owns(&g));
    }
}
