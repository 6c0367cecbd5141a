//! # Spin Lock

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

/// A busy-waiting mutual-exclusion lock for short, bounded critical sections.
///
/// All memory-management hot paths (buddy free lists, heap range lists,
/// pooled object allocators) take this lock for the full critical section,
/// including any split or coalesce loop; those loops are `O(log pages)`, so
/// hold times stay small.
///
/// # Caveats
/// - Does **not** disable interrupts; callers that can re-enter from an
///   interrupt handler must mask interrupts themselves.
/// - No poisoning: a panic inside the closure leaves the lock held.
pub struct SpinLock<T> {
    /// `false` = unlocked, `true` = locked.
    locked: AtomicBool,
    inner: UnsafeCell<T>,
}

// Safety: the lock serializes all access to the inner value.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Run `f` with exclusive access to the protected value.
    ///
    /// Spins until the lock is acquired and releases it when `f` returns.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        // SAFETY: the exchange above grants exclusive access until the
        // release store below.
        let result = f(unsafe { &mut *self.inner.get() });
        self.locked.store(false, Ordering::Release);
        result
    }

    /// Exclusive access through an exclusive reference; no locking needed.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}
