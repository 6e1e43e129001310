// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cancellation-aware sleeping, multi-thread join with aggregated errors, and the
//! reentrancy-guard free function.

use std::time::Duration;

use crate::clock::{Budget, Clock, SystemClock};
use crate::config::RuntimeConfig;
use crate::error::{AggregateError, Error, FailedWorker, Result};
use crate::sync::AbortConcurrentCalls;
use crate::thread::interruptible;
use crate::thread::Thread;

/// Sleeps for `duration`, checking for cancellation between slices.
///
/// Inside a managed worker ([`thread::spawn`][crate::thread::spawn] or
/// [`ThreadGroup::run`][crate::ThreadGroup::run]), this is a cancellation safe point: if the
/// worker's cancellation is requested while sleeping, it unwinds right here rather than
/// completing the full duration. Outside a managed worker, this is a plain chunked sleep — there
/// is nothing to cancel, so it always runs the full duration.
pub fn sleep(duration: Duration) {
    match interruptible::current() {
        Some(shared) => {
            let clock = shared.clock();
            let mut budget = Budget::new(clock, duration, shared.config().granularity());
            loop {
                interruptible::check_cancelled();
                match budget.next_slice(clock) {
                    Some(slice) => std::thread::sleep(slice),
                    None => return,
                }
            }
        }
        None => {
            let clock = SystemClock;
            let granularity = RuntimeConfig::DEFAULT.granularity();
            let mut budget = Budget::new(&clock, duration, granularity);
            while let Some(slice) = budget.next_slice(&clock) {
                std::thread::sleep(slice);
            }
        }
    }
}

/// Blocks until every thread in `threads` is done, or `timeout` elapses, polling via
/// [`sleep`] so a call made from inside a managed worker remains cancellable.
///
/// On success, joins every thread (reclaiming its OS thread) and aggregates any non-shutdown
/// errors they raised into a single [`Error::Aggregate`].
///
/// # Errors
///
/// Returns [`Error::Timeout`] if `timeout` elapses before every thread is done. Returns
/// [`Error::Aggregate`] if every thread finished but one or more raised a non-shutdown error.
pub fn wait_for(threads: &[&Thread], timeout: Option<Duration>) -> Result<()> {
    let clock = SystemClock;
    let granularity = Duration::from_millis(10);
    let mut budget = match timeout {
        Some(t) => Budget::new(&clock, t, granularity),
        None => Budget::unbounded(granularity),
    };

    loop {
        if threads.iter().all(|t| t.done()) {
            break;
        }
        match budget.next_slice(&clock) {
            Some(slice) => sleep(slice),
            None => return Err(Error::Timeout),
        }
    }

    let failures: Vec<FailedWorker> = threads
        .iter()
        .filter_map(|t| {
            t.join().err().map(|error| FailedWorker {
                label: t.label().to_string(),
                message: error.to_string(),
            })
        })
        .collect();

    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::Aggregate(AggregateError::new(failures)))
    }
}

/// Runs `f` through `guard`, dropping overlapping calls instead of queuing them.
///
/// The free-function form of [`AbortConcurrentCalls`]: if another call through the same
/// `guard` is already in flight, this returns `None` immediately without invoking `f` at all.
pub fn abort_concurrent_calls<F, R>(guard: &AbortConcurrentCalls, f: F) -> Option<R>
where
    F: FnOnce() -> R,
{
    guard.call(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn sleep_outside_worker_runs_full_duration() {
        let start = std::time::Instant::now();
        sleep(Duration::from_millis(30));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn sleep_inside_worker_unwinds_on_cancellation() {
        let ready = Arc::new(std::sync::Barrier::new(2));
        let worker_ready = Arc::clone(&ready);

        let worker = crate::thread::spawn(move || {
            worker_ready.wait();
            sleep(Duration::from_secs(100));
        });

        ready.wait();
        worker.stop(Duration::from_secs(5)).unwrap();
        assert!(worker.done());
    }

    #[test]
    fn wait_for_times_out_while_worker_still_running() {
        let ready = Arc::new(std::sync::Barrier::new(2));
        let worker_ready = Arc::clone(&ready);

        let worker = crate::thread::spawn(move || {
            worker_ready.wait();
            sleep(Duration::from_secs(100));
        });

        ready.wait();
        let result = wait_for(&[&worker], Some(Duration::from_millis(50)));
        assert!(matches!(result, Err(Error::Timeout)));

        worker.stop(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn wait_for_aggregates_worker_errors() {
        let worker = crate::thread::spawn(|| panic!("boom"));
        let result = wait_for(&[&worker], Some(Duration::from_secs(5)));
        assert!(matches!(result, Err(Error::Aggregate(_))));
    }

    #[test]
    fn abort_concurrent_calls_drops_overlapping_call() {
        let guard = Arc::new(AbortConcurrentCalls::new());
        let barrier = Arc::new(std::sync::Barrier::new(2));

        let g1 = Arc::clone(&guard);
        let b1 = Arc::clone(&barrier);
        let first = std::thread::spawn(move || {
            abort_concurrent_calls(&g1, || {
                b1.wait();
                std::thread::sleep(Duration::from_millis(30));
                "first"
            })
        });

        barrier.wait();
        std::thread::sleep(Duration::from_millis(5));
        let second = abort_concurrent_calls(&guard, || "second");

        assert_eq!(second, None);
        assert_eq!(first.join().unwrap(), Some("first"));
    }
}
