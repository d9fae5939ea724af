//! Single-byte spinlock.
//!
//! Per-instance locks in the runtime protect objects that are themselves
//! only a few words long (invocations, detached revisions, handles), so
//! the lock must not cost more than one byte. Fairness is explicitly not
//! guaranteed; hold times are expected to be tens of nanoseconds.
//!
//! The slow path spins with exponential backoff and eventually yields to
//! the OS scheduler, which is enough for the short critical sections the
//! runtime has.

use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicU8, Ordering};

const UNLOCKED: u8 = 0;
const LOCKED: u8 = 1;

/// A one-byte test-and-test-and-set spinlock.
///
/// This deliberately does not hand out an RAII guard: the runtime's lock
/// manager does its own bookkeeping of held locks and drains deferred work
/// on the final unlock, so raw `lock`/`unlock` is the primitive it needs.
#[derive(Debug)]
pub struct SpinLock {
    state: AtomicU8,
}

impl SpinLock {
    /// Create a new, unlocked lock.
    #[inline]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNLOCKED),
        }
    }

    /// Acquire the lock, spinning until it is available.
    #[inline]
    pub fn lock(&self) {
        if self.try_lock() {
            return;
        }
        self.lock_slow();
    }

    #[cold]
    fn lock_slow(&self) {
        let backoff = Backoff::new();
        loop {
            // Spin on the read before retrying the RMW so contended locks
            // stay in shared cache state.
            while self.state.load(Ordering::Relaxed) == LOCKED {
                backoff.snooze();
            }
            if self.try_lock() {
                return;
            }
        }
    }

    /// Try to acquire the lock without blocking. Returns true on success.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the lock.
    ///
    /// Calling this without holding the lock is a logic error; debug builds
    /// assert against it.
    #[inline]
    pub fn unlock(&self) {
        debug_assert_eq!(self.state.load(Ordering::Relaxed), LOCKED);
        self.state.store(UNLOCKED, Ordering::Release);
    }

    /// Is the lock currently held by someone?
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) == LOCKED
    }

    /// Run `f` with the lock held.
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock();
        let result = f();
        self.unlock();
        result
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

static_assertions::assert_eq_size!(SpinLock, u8);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_lock_unlock() {
        let lock = SpinLock::new();
        assert!(!lock.is_locked());
        lock.lock();
        assert!(lock.is_locked());
        lock.unlock();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_try_lock() {
        let lock = SpinLock::new();
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn test_with() {
        let lock = SpinLock::new();
        let value = lock.with(|| 42);
        assert_eq!(value, 42);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_contended_counter() {
        let lock = Arc::new(SpinLock::new());
        let counter = Arc::new(std::cell::UnsafeCell::new(0usize));

        struct SendPtr(Arc<std::cell::UnsafeCell<usize>>);
        unsafe impl Send for SendPtr {}

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let counter = SendPtr(Arc::clone(&counter));
            handles.push(std::thread::spawn(move || {
                let counter = counter;
                for _ in 0..10_000 {
                    lock.lock();
                    unsafe { *counter.0.get() += 1 };
                    lock.unlock();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(unsafe { *counter.get() }, 40_000);
    }
}
