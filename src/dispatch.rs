// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A single-worker FIFO serializer for function calls, and the mechanical wrapping that
//! routes a whole type's public surface through one.
//!
//! [`DispatchQueue`] is the concrete component the data model calls "DispatchQueue": a
//! dedicated [`Thread`][crate::Thread] that drains a FIFO of boxed thunks strictly in
//! submission order. [`queued_dispatcher!`] is the macro form of "QueuedDispatcher" — rather
//! than reflecting over a type's public methods at runtime (which Rust gives us no sound way
//! to do), it generates, at the call site, a wrapper type whose every public method dispatches
//! through one queue per instance.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use crate::clock::{Budget, Clock};
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::thread::interruptible;
use crate::thread::Thread;

static NEXT_QUEUE_INDEX: AtomicUsize = AtomicUsize::new(0);

type Job = Box<dyn FnOnce() + Send>;

/// A single-thread serializer for function calls.
///
/// Every call submitted via [`DispatchQueue::dispatch`] or [`DispatchQueue::dispatch_future`]
/// runs on this queue's one dedicated worker thread, strictly in submission order — interleaved
/// arbitrarily with calls from other callers, but never reordered relative to calls from the
/// same caller. This is the supported way to serialize access to shared state without per-field
/// locking: move the state behind the queue (see [`queued_dispatcher!`]) and every access
/// becomes a dispatched call.
///
/// Dropping a `DispatchQueue` does not wait for its worker to drain the backlog; call
/// [`DispatchQueue::stop`] first for deterministic shutdown.
#[derive(Debug)]
pub struct DispatchQueue {
    job_tx: mpsc::Sender<Job>,
    worker: Thread,
    worker_thread_id: std::thread::ThreadId,
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchQueue {
    /// Creates a queue with its own dedicated worker thread, using the default
    /// [`RuntimeConfig`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::DEFAULT)
    }

    /// As [`DispatchQueue::new`], with an explicit [`RuntimeConfig`].
    #[must_use]
    pub fn with_config(config: RuntimeConfig) -> Self {
        let index = NEXT_QUEUE_INDEX.fetch_add(1, Ordering::Relaxed);
        let label = format!("marshal-dispatch-{index}");

        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let granularity = config.granularity();

        let worker = Thread::spawn_with(label, config, move || {
            let clock = crate::clock::SystemClock;
            loop {
                match recv_job(&job_rx, &clock, granularity) {
                    Some(job) => job(),
                    None => return,
                }
            }
        });

        let worker_thread_id = worker.os_thread_id();

        Self {
            job_tx,
            worker,
            worker_thread_id,
        }
    }

    fn is_own_worker(&self) -> bool {
        std::thread::current().id() == self.worker_thread_id
    }

    /// Enqueues `f` and blocks until it has run, returning its result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalDispatch`] if called from this queue's own worker thread — that
    /// call would have to wait for itself to finish, which would deadlock. Use
    /// [`DispatchQueue::safe_dispatch`] from code that may run on the queue's worker.
    ///
    /// Returns [`Error::Closed`] if the queue has been [`stop`][DispatchQueue::stop]ped and
    /// `f` was discarded rather than run.
    pub fn dispatch<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_own_worker() {
            return Err(Error::IllegalDispatch);
        }

        let rx = self.enqueue(f)?;
        match rx.recv() {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Closed),
        }
    }

    /// Enqueues `f` and returns immediately with a receiver for its eventual result, without
    /// blocking the caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalDispatch`] under the same condition as
    /// [`DispatchQueue::dispatch`].
    pub fn dispatch_future<F, R>(&self, f: F) -> Result<oneshot::Receiver<Result<R>>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_own_worker() {
            return Err(Error::IllegalDispatch);
        }

        self.enqueue(f)
    }

    /// Runs `f` inline if called from this queue's own worker thread (the re-entrant case that
    /// would otherwise deadlock [`DispatchQueue::dispatch`]); otherwise dispatches it exactly
    /// like `dispatch`.
    ///
    /// This is the only mechanism in this crate that avoids self-deadlock on recursive queue
    /// access.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if dispatched (not inlined) and the queue has been stopped.
    pub fn safe_dispatch<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_own_worker() {
            Ok(f())
        } else {
            self.dispatch(f)
        }
    }

    fn enqueue<F, R>(&self, f: F) -> Result<oneshot::Receiver<Result<R>>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(f));
            match outcome {
                Ok(value) => {
                    let _ = tx.send(Ok(value));
                }
                Err(payload) => {
                    if interruptible::is_cancel_signal(&payload) {
                        // Let this unwind all the way out to the worker's own bootstrap, which
                        // classifies it as a normal shutdown rather than a job failure. `tx` is
                        // dropped here, so any pending `dispatch()` call observes `Closed`.
                        panic::resume_unwind(payload);
                    }
                    let _ = tx.send(Err(Error::from_panic(payload)));
                }
            }
        });

        self.job_tx.send(job).map_err(|_| Error::Closed)?;
        Ok(rx)
    }

    /// Requests cancellation of this queue's worker, waiting up to `timeout` for the job
    /// currently running (if any) to reach a safe point and the worker to finish. Any job still
    /// queued behind it is dropped without running, which resolves its caller's pending
    /// `dispatch()` with [`Error::Closed`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if `timeout` elapses first, in which case the worker keeps
    /// running (see [`Thread::stop`] for the full contract).
    pub fn stop(&self, timeout: Duration) -> Result<()> {
        self.worker.stop(timeout)
    }

    /// Whether this queue's worker has not yet finished.
    #[must_use]
    pub fn running(&self) -> bool {
        self.worker.running()
    }
}

fn recv_job(rx: &mpsc::Receiver<Job>, clock: &dyn Clock, granularity: Duration) -> Option<Job> {
    let mut budget = Budget::unbounded(granularity);
    loop {
        interruptible::check_cancelled();
        let slice = budget.next_slice(clock).unwrap_or(granularity);
        match rx.recv_timeout(slice) {
            Ok(job) => return Some(job),
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => return None,
        }
    }
}

/// Dispatches `f` onto `queue` and blocks for its result — the free-function form of routing a
/// single call through a queue, for call sites that do not want to wrap a whole type with
/// [`queued_dispatcher!`].
///
/// # Errors
///
/// As [`DispatchQueue::dispatch`].
pub fn queued_dispatch<F, R>(queue: &DispatchQueue, f: F) -> Result<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    queue.dispatch(f)
}

/// Generates a type whose every public method runs on a private, per-instance
/// [`DispatchQueue`], serializing all access to its state through one worker thread.
///
/// This is the macro form of the "QueuedDispatcher" class trait: Rust has no runtime reflection
/// over a type's public surface, so instead of wrapping an existing type after the fact, this
/// macro generates the wrapper at the call site from a struct definition and an `impl` block.
/// The constructor (always named `new`) builds the unwrapped state directly; every other method
/// is rewritten to capture its arguments, send them to the instance's queue, and block for the
/// result — so every generated method (other than `new`) returns
/// [`Result<R>`][crate::error::Result] instead of its declared `R` directly, reflecting that the
/// call actually crossed a thread.
///
/// Field and method visibility other than `pub`/private is not supported; `self` must be `&self`
/// or `&mut self` (the queue makes mutation safe either way, since only one call runs at a time).
///
/// ```
/// use marshal_rt::queued_dispatcher;
///
/// queued_dispatcher! {
///     mod counter_dispatch {
///         pub struct Counter {
///             count: i64,
///         }
///
///         impl Counter {
///             pub fn new(count: i64) -> Self {
///                 Self { count }
///             }
///
///             pub fn increment(&mut self, by: i64) -> i64 {
///                 self.count += by;
///                 self.count
///             }
///
///             pub fn get(&self) -> i64 {
///                 self.count
///             }
///         }
///     }
/// }
///
/// let counter = counter_dispatch::Counter::new(0);
/// assert_eq!(counter.increment(5).unwrap(), 5);
/// assert_eq!(counter.get().unwrap(), 5);
/// ```
#[macro_export]
macro_rules! queued_dispatcher {
    (
        $(#[$mod_meta:meta])*
        $mod_vis:vis mod $mod_name:ident {
            $(#[$struct_meta:meta])*
            $struct_vis:vis struct $name:ident {
                $($field_vis:vis $field:ident : $field_ty:ty),* $(,)?
            }

            impl $name2:ident {
                $(#[$new_meta:meta])*
                $new_vis:vis fn new($($new_arg:ident : $new_ty:ty),* $(,)?) -> Self $new_body:block

                $(
                    $(#[$method_meta:meta])*
                    $method_vis:vis fn $method:ident(& $(mut)? self $(, $arg:ident : $arg_ty:ty)* $(,)?) -> $ret:ty $body:block
                )*
            }
        }
    ) => {
        $(#[$mod_meta])*
        $mod_vis mod $mod_name {
            // Nested so the unwrapped state type can share the public wrapper's name without
            // colliding with it — `inner::Counter` and `Counter` are distinct paths even
            // though the user wrote `Counter` only once.
            mod inner {
                $(#[$struct_meta])*
                pub(super) struct $name {
                    $($field_vis $field : $field_ty),*
                }

                impl $name {
                    $(#[$new_meta])*
                    pub(super) fn new($($new_arg : $new_ty),*) -> Self $new_body

                    $(
                        $(#[$method_meta])*
                        #[allow(unused_mut)]
                        pub(super) fn $method(&mut self $(, $arg : $arg_ty)*) -> $ret $body
                    )*
                }
            }

            $(#[$struct_meta])*
            $struct_vis struct $name2 {
                state: ::std::sync::Arc<$crate::sync::Lock<inner::$name>>,
                queue: ::std::sync::Arc<$crate::DispatchQueue>,
            }

            impl $name2 {
                $(#[$new_meta])*
                $new_vis fn new($($new_arg : $new_ty),*) -> Self {
                    Self {
                        state: ::std::sync::Arc::new($crate::sync::Lock::new(inner::$name::new($($new_arg),*))),
                        queue: ::std::sync::Arc::new($crate::DispatchQueue::new()),
                    }
                }

                $(
                    $(#[$method_meta])*
                    $method_vis fn $method(&self $(, $arg : $arg_ty)*) -> $crate::Result<$ret> {
                        let state = ::std::sync::Arc::clone(&self.state);
                        self.queue.dispatch(move || {
                            let mut guard = state
                                .lock()
                                .expect("queued dispatcher state lock is never poisoned on this crate's own account");
                            guard.$method($($arg),*)
                        })
                    }
                )*
            }
        }
    };
}
