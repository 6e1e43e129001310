// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The public, ungrouped thread handle, and the free function used to spawn one.
//!
//! [`Thread`] is the façade described by spec component "Public Thread handle": it wraps
//! an [`interruptible::Interruptible`] and the underlying OS [`std::thread::JoinHandle`],
//! and exposes the small, stable surface user code drives (`stop`, `wait`, `running`,
//! `stopping`) without leaking the cancellation machinery underneath.

pub(crate) mod interruptible;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::RuntimeConfig;
use crate::error::Result;
use interruptible::Interruptible;

static NEXT_THREAD_INDEX: AtomicUsize = AtomicUsize::new(0);

/// A handle to a managed worker thread.
///
/// Dropping a `Thread` does not stop or join it — a worker keeps running until it
/// finishes on its own or someone calls [`Thread::stop`]. This mirrors the teacher
/// runtime's non-blocking-drop `JoinHandle` convention: callers that need deterministic
/// teardown call `stop`/`wait` (or `join`) explicitly, typically via
/// [`ThreadGroup::scope`][crate::ThreadGroup::scope].
#[derive(Debug)]
pub struct Thread {
    shared: Arc<Interruptible>,
    join_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Thread {
    pub(crate) fn spawn_with(
        label: String,
        config: RuntimeConfig,
        body: impl FnOnce() + Send + std::panic::UnwindSafe + 'static,
    ) -> Self {
        Self::spawn_with_hook(label, config, body, None)
    }

    /// As `spawn_with`, plus a hook invoked with the worker's failure message (`None` on
    /// success or cancellation) once its outcome is known but before `done` is signalled.
    /// [`ThreadGroup`][crate::ThreadGroup] uses this to learn about failures promptly
    /// enough to cancel siblings.
    pub(crate) fn spawn_with_hook(
        label: String,
        config: RuntimeConfig,
        body: impl FnOnce() + Send + std::panic::UnwindSafe + 'static,
        on_finished: Option<Box<dyn FnOnce(Option<String>) + Send>>,
    ) -> Self {
        let shared = Interruptible::new(label, config);
        let worker_shared = Arc::clone(&shared);

        let join_handle = std::thread::Builder::new()
            .name(worker_shared.label.clone())
            .spawn(move || interruptible::bootstrap(worker_shared, body, on_finished))
            .expect("failed to spawn OS thread");

        Self {
            shared,
            join_handle: Mutex::new(Some(join_handle)),
        }
    }

    /// Requests that this worker stop, waiting up to `timeout` for it to reach a safe
    /// point and finish.
    ///
    /// - If `done` is already set, or another `stop` call is already in progress, this is
    ///   a no-op that returns `Ok(())` immediately.
    /// - If called from the worker's own thread, converts directly into a local
    ///   cancellation unwind.
    /// - Otherwise, blocks (up to `timeout`) for any active [`Shield`][crate::Shield] to
    ///   release, then requests cancellation and waits for `done`. Returns
    ///   [`Error::Timeout`][crate::Error::Timeout] if `timeout` elapses first, in which
    ///   case the worker keeps running.
    ///
    /// `stop(Duration::ZERO)` is non-blocking and best-effort: it requests cancellation
    /// (if no shield is held) and returns immediately without waiting for `done` — which
    /// means it returns [`Error::Timeout`][crate::Error::Timeout] unless the worker happens
    /// to already be done, exactly as a larger `timeout` would if it elapsed before `done`
    /// was observed. Callers that only care about requesting cancellation, not confirming
    /// it landed, can discard the result.
    pub fn stop(&self, timeout: Duration) -> Result<()> {
        self.shared.stop(timeout)
    }

    /// Blocks up to `timeout` for this worker to finish, without requesting cancellation.
    /// Returns whether it finished within the budget.
    #[must_use]
    pub fn wait(&self, timeout: Duration) -> bool {
        self.shared.wait(timeout)
    }

    /// Blocks indefinitely for this worker to finish, then returns the error it raised (if
    /// any non-shutdown error occurred). Also reclaims the underlying OS thread.
    pub fn join(&self) -> Result<()> {
        self.shared.wait_indefinitely();
        if let Some(handle) = self.join_handle.lock().expect("join handle mutex poisoned").take() {
            let _ = handle.join();
        }
        self.shared.take_outcome().unwrap_or(Ok(()))
    }

    /// Whether this worker has not yet finished.
    #[must_use]
    pub fn running(&self) -> bool {
        self.shared.is_running()
    }

    /// Whether cancellation has been requested for this worker.
    #[must_use]
    pub fn stopping(&self) -> bool {
        self.shared.is_stopping()
    }

    /// Whether this worker has finished (successfully, on cancellation, or on error).
    #[must_use]
    pub fn done(&self) -> bool {
        self.shared.is_done()
    }

    pub(crate) fn shared(&self) -> &Arc<Interruptible> {
        &self.shared
    }

    /// The OS thread id backing this worker, known as soon as the thread is spawned.
    ///
    /// [`DispatchQueue`][crate::DispatchQueue] uses this to detect recursive dispatch from its
    /// own worker without waiting for the worker to install its thread-local context.
    pub(crate) fn os_thread_id(&self) -> std::thread::ThreadId {
        self.join_handle
            .lock()
            .expect("join handle mutex poisoned")
            .as_ref()
            .map(std::thread::JoinHandle::thread)
            .map(std::thread::Thread::id)
            .unwrap_or_else(|| std::thread::current().id())
    }

    /// This worker's label (its thread name).
    #[must_use]
    pub fn label(&self) -> &str {
        &self.shared.label
    }
}

/// Spawns an ungrouped managed worker thread running `f`, using the default
/// [`RuntimeConfig`].
///
/// This is the direct counterpart to [`ThreadGroup::run`][crate::ThreadGroup::run] for
/// callers that do not need structured-concurrency error aggregation across siblings —
/// just one interruptible thread whose error (if any) is retrieved via
/// [`Thread::join`].
pub fn spawn<F>(f: F) -> Thread
where
    F: FnOnce() + Send + std::panic::UnwindSafe + 'static,
{
    spawn_with_config(f, RuntimeConfig::DEFAULT)
}

/// As [`spawn`], with an explicit [`RuntimeConfig`].
pub fn spawn_with_config<F>(f: F, config: RuntimeConfig) -> Thread
where
    F: FnOnce() + Send + std::panic::UnwindSafe + 'static,
{
    let index = NEXT_THREAD_INDEX.fetch_add(1, Ordering::Relaxed);
    Thread::spawn_with(format!("marshal-worker-{index}"), config, move || f())
}

/// Returns a handle to the worker thread the caller is currently running as, if any.
///
/// `None` on any thread not started via [`spawn`] or [`ThreadGroup::run`][crate::ThreadGroup::run].
#[must_use]
pub fn current() -> Option<CurrentThread> {
    interruptible::current().map(CurrentThread)
}

/// A reference to the calling thread's own managed context, obtained via [`current`].
///
/// Exists mainly so worker code can self-stop (`current().unwrap().stop(...)`), which
/// converts directly into a local cancellation unwind rather than requiring the caller to
/// hold on to the `Thread` handle its owner was given at spawn time.
#[derive(Debug, Clone)]
pub struct CurrentThread(Arc<Interruptible>);

impl CurrentThread {
    /// Requests cancellation of the calling thread itself — always converts into an
    /// immediate local unwind, regardless of any active [`Shield`][crate::Shield].
    pub fn stop(&self) -> Result<()> {
        self.0.stop(Duration::ZERO)
    }

    /// Whether cancellation has been requested for the calling thread.
    #[must_use]
    pub fn stopping(&self) -> bool {
        self.0.is_stopping()
    }
}
