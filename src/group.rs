// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Structured-concurrency scope: run a fan-out of workers, cancel the rest on first
//! failure, and raise an aggregated error on scope exit.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::RuntimeConfig;
use crate::error::{AggregateError, Error, FailedWorker, Result};
use crate::thread::Thread;

struct WorkerOutcome {
    label: String,
    failure: Option<String>,
}

struct Inner {
    label: String,
    config: RuntimeConfig,
    next_index: AtomicUsize,
    spawned: Mutex<Vec<Arc<Thread>>>,
    outcome_tx: mpsc::Sender<WorkerOutcome>,
    stopping: AtomicBool,
}

/// A structured-concurrency scope over a fan-out of worker threads.
///
/// Obtained only via [`ThreadGroup::scope`], which guarantees that by the time it returns
/// (successfully or with an error), every worker spawned through the group has finished and
/// been joined — there is no way to leak a running worker out of a scope.
///
/// `ThreadGroup` is cheaply `Clone`: cloning shares the same underlying scope, which is how
/// a worker spawned by the group gets its own handle to call [`ThreadGroup::stop`] (e.g. to
/// cancel its siblings once it has produced a result, as
/// [`Channel::get_first`][crate::Channel::get_first] does).
#[derive(Debug, Clone)]
pub struct ThreadGroup {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("label", &self.label)
            .field("stopping", &self.stopping.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ThreadGroup {
    /// Runs `body` with a fresh group, waits for every worker it spawned to finish, and
    /// returns `body`'s own result — or the group's aggregated error, if any worker failed.
    ///
    /// On happy path, this returns once every spawned worker's `done` flag is set. If any
    /// worker raises a non-shutdown error, the group cancels every other still-running
    /// worker (the same cancellation model as [`Thread::stop`]) and, once all have
    /// finished, returns [`Error::Aggregate`] instead of `body`'s result. A worker whose
    /// failure arrives after the cascade has already begun is discarded — only the
    /// first failure is reported, per this crate's resolution of the upstream
    /// implementation's ambiguity about exactly which failures survive a concurrent
    /// cascade.
    ///
    /// If `body` itself panics, every already-spawned worker is still cancelled and joined
    /// before the panic resumes — a panicking scope does not leak running threads.
    pub fn scope<R>(body: impl FnOnce(&ThreadGroup) -> R) -> Result<R> {
        Self::scope_with_config(RuntimeConfig::DEFAULT, body)
    }

    /// As [`ThreadGroup::scope`], with an explicit [`RuntimeConfig`] applied to every
    /// worker spawned through the group.
    pub fn scope_with_config<R>(
        config: RuntimeConfig,
        body: impl FnOnce(&ThreadGroup) -> R,
    ) -> Result<R> {
        Self::scope_named("group", config, body)
    }

    /// As [`ThreadGroup::scope_with_config`], with an explicit label used as the prefix
    /// for every spawned worker's thread name.
    pub fn scope_named<R>(
        label: impl Into<String>,
        config: RuntimeConfig,
        body: impl FnOnce(&ThreadGroup) -> R,
    ) -> Result<R> {
        let (tx, rx) = mpsc::channel();
        let group = Self {
            inner: Arc::new(Inner {
                label: label.into(),
                config,
                next_index: AtomicUsize::new(0),
                spawned: Mutex::new(Vec::new()),
                outcome_tx: tx,
                stopping: AtomicBool::new(false),
            }),
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| body(&group)));

        let spawned_count = group.inner.spawned.lock().expect("spawned mutex poisoned").len();
        let failures = group.drain_outcomes(spawned_count, rx);

        // Every spawned worker is done by construction of drain_outcomes (it waits for
        // spawned_count reports), but the underlying OS threads still need joining to
        // reclaim them and to surface any worker whose outcome was recorded directly (the
        // common, non-racy case).
        for worker in group.inner.spawned.lock().expect("spawned mutex poisoned").drain(..) {
            let _ = worker.join();
        }

        let body_result = match result {
            Ok(r) => r,
            Err(payload) => panic::resume_unwind(payload),
        };

        if failures.is_empty() {
            Ok(body_result)
        } else {
            Err(Error::Aggregate(AggregateError::new(failures)))
        }
    }

    fn drain_outcomes(&self, spawned_count: usize, rx: mpsc::Receiver<WorkerOutcome>) -> Vec<FailedWorker> {
        let mut failures = Vec::new();
        for _ in 0..spawned_count {
            let Ok(outcome) = rx.recv() else {
                break;
            };
            if let Some(message) = outcome.failure {
                failures.push(FailedWorker {
                    label: outcome.label,
                    message,
                });
            }
        }
        failures
    }

    /// Spawns a worker bound to this group.
    ///
    /// If `f` raises a non-shutdown error, the group is told about it immediately (before
    /// this method's caller necessarily observes it) and cancels every other worker
    /// currently running in the group.
    ///
    /// The returned handle is shared with the group itself (which needs to retain it to
    /// cancel and join it at scope exit), so it comes back wrapped in an `Arc` rather than
    /// by value.
    pub fn run<F>(&self, f: F) -> Arc<Thread>
    where
        F: FnOnce() + Send + std::panic::UnwindSafe + 'static,
    {
        let index = self.inner.next_index.fetch_add(1, Ordering::Relaxed);
        let label = format!("{}-{index}", self.inner.label);

        let tx = self.inner.outcome_tx.clone();
        let report_label = label.clone();
        let group_for_cascade = self.clone();

        let on_finished = move |failure: Option<String>| {
            if failure.is_some() && !group_for_cascade.inner.stopping.swap(true, Ordering::SeqCst) {
                group_for_cascade.cancel_siblings();
            }
            let _ = tx.send(WorkerOutcome {
                label: report_label,
                failure,
            });
        };

        let thread = Arc::new(Thread::spawn_with_hook(
            label,
            self.inner.config,
            f,
            Some(Box::new(on_finished)),
        ));

        self.inner
            .spawned
            .lock()
            .expect("spawned mutex poisoned")
            .push(Arc::clone(&thread));

        thread
    }

    /// Requests cancellation of every worker currently running in this group and marks
    /// the group as stopping, so any failure reported afterward is discarded rather than
    /// added to the aggregate.
    pub fn stop(&self) {
        if !self.inner.stopping.swap(true, Ordering::SeqCst) {
            self.cancel_siblings();
        }
    }

    fn cancel_siblings(&self) {
        let current = std::thread::current().id();
        let spawned = self.inner.spawned.lock().expect("spawned mutex poisoned");
        for worker in spawned.iter() {
            // Skip the worker calling this (e.g. the one whose own failure triggered the
            // cascade): stopping the current thread takes the self-stop branch in
            // `Interruptible::stop`, which panics immediately to unwind locally rather than
            // returning, and must not be invoked from inside the `on_finished` hook that
            // runs before that worker has reported its outcome or signalled `done`.
            if worker.os_thread_id() == current {
                continue;
            }
            if worker.running() {
                let _ = worker.stop(Duration::ZERO);
            }
        }
    }
}
