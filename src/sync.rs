// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cancellation-aware synchronization primitives.
//!
//! [`Lock<T>`] is the concrete "system's Lock wrapper" referenced throughout the
//! specification's component design: the supported way for worker code to guard shared
//! state such that cancellation, should it land while the lock is held, does not leave the
//! state permanently locked. Plain [`std::sync::Mutex`] is not wired into this story —
//! acquiring one blocks uninterruptibly, and releasing one on cancellation works only
//! because Rust's RAII guard unwinds regardless, which is the one piece of the original
//! per-thread "acquired lock set" this crate gets for free rather than having to track by
//! hand.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use crate::clock::{Budget, SystemClock};
use crate::error::Result;
use crate::thread::interruptible;

/// A mutex whose blocking acquisition is itself a cancellation safe point.
///
/// `std::sync::Mutex::lock` cannot be interrupted or bounded by a timeout, so `Lock<T>`
/// polls `try_lock` in granularity-sized slices instead, checking for the current worker's
/// cancellation between attempts. If cancellation lands while a worker is waiting to
/// acquire the lock, the wait unwinds right there rather than deadlocking the shutdown.
///
/// Once acquired, releasing the lock is ordinary Rust: the returned guard's `Drop`
/// releases it, including during the unwind triggered by a cancellation that lands while
/// the lock is held — there is no separate per-thread "acquired set" to maintain.
#[derive(Debug, Default)]
pub struct Lock<T> {
    inner: Mutex<T>,
}

impl<T> Lock<T> {
    /// Wraps `value` behind a cancellation-aware mutex.
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Blocks until the lock is acquired, polling for the current worker's cancellation
    /// between attempts. Outside a managed worker, behaves like a plain blocking
    /// acquisition (nothing to cancel).
    ///
    /// Cancellation does not surface as an `Err` here — it unwinds the caller directly, the
    /// same as any other safe point. This never returns `Err` on this crate's own account;
    /// the `Result` exists only to recover a mutex poisoned by an earlier panic rather than
    /// panicking again here.
    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        let granularity = interruptible::current()
            .map(|shared| shared.config().granularity())
            .unwrap_or(Duration::from_millis(10));
        let clock = SystemClock;
        let mut budget = Budget::unbounded(granularity);

        loop {
            match self.inner.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    interruptible::check_cancelled();
                    let slice = budget.next_slice(&clock).unwrap_or(granularity);
                    std::thread::sleep(slice);
                }
            }
        }
    }
}

/// Acquires `mutex`, retrying past the current worker's cancellation if it lands mid-wait,
/// rather than unwinding.
///
/// This is the internal building block the worker teardown path uses to take its own
/// bookkeeping locks "safely": teardown must run to completion even though cancellation
/// has, by definition, just been requested. User code should reach for this only when it
/// is implementing similarly uncancellable cleanup.
pub fn lock_uninterruptible<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    loop {
        match mutex.try_lock() {
            Ok(guard) => return guard,
            Err(TryLockError::Poisoned(poisoned)) => return poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => std::thread::sleep(Duration::from_millis(1)),
        }
    }
}

/// A reentrancy guard that drops overlapping calls rather than queuing them.
///
/// Mirrors `abort_concurrent_calls`: wrap a function (or, per-instance, a method) so that
/// if a call is already in flight when a second one arrives, the second returns `None`
/// immediately instead of running `f` at all.
#[derive(Debug, Default)]
pub struct AbortConcurrentCalls {
    in_flight: AtomicBool,
}

impl AbortConcurrentCalls {
    /// Creates a guard with no call in flight.
    #[must_use]
    pub fn new() -> Self {
        Self {
            in_flight: AtomicBool::new(false),
        }
    }

    /// Runs `f` unless another call is already in flight, in which case returns `None`
    /// without invoking `f`.
    pub fn call<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce() -> R,
    {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }

        let _guard = scopeguard::guard(&self.in_flight, |flag| {
            flag.store(false, Ordering::SeqCst);
        });
        Some(f())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn lock_is_acquired_and_released_like_a_mutex() {
        let lock = Lock::new(0);
        *lock.lock().unwrap() += 1;
        *lock.lock().unwrap() += 1;
        assert_eq!(*lock.lock().unwrap(), 2);
    }

    #[test]
    fn lock_blocks_other_threads_until_released() {
        let lock = Arc::new(Lock::new(0));
        let guard = lock.lock().unwrap();

        let other = Arc::clone(&lock);
        let handle = std::thread::spawn(move || {
            *other.lock().unwrap() += 1;
        });

        std::thread::sleep(Duration::from_millis(30));
        assert!(!handle.is_finished());
        drop(guard);
        handle.join().unwrap();
        assert_eq!(*lock.lock().unwrap(), 1);
    }

    #[test]
    fn abort_concurrent_calls_drops_the_second_caller() {
        let guard = Arc::new(AbortConcurrentCalls::new());
        let barrier = Arc::new(std::sync::Barrier::new(2));

        let g1 = Arc::clone(&guard);
        let b1 = Arc::clone(&barrier);
        let first = std::thread::spawn(move || {
            g1.call(|| {
                b1.wait();
                std::thread::sleep(Duration::from_millis(50));
                "first"
            })
        });

        barrier.wait();
        std::thread::sleep(Duration::from_millis(10));
        let second = guard.call(|| "second");
        assert_eq!(second, None);
        assert_eq!(first.join().unwrap(), Some("first"));
    }
}
