// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The interruptible-thread core: the shared state behind every managed worker, the
//! cooperative cancellation signal, and the thread-local context that [`Shield`][crate::Shield]
//! and [`sleep`][crate::sleep] rely on.
//!
//! A worker is never literally interrupted mid-instruction (that would require true
//! asynchronous signal injection, which the host gives us no sound way to do). Instead,
//! cancellation is a token checked at a fixed set of safe points — [`check_cancelled`] is
//! that check. When it observes that cancellation has been requested, it panics with a
//! private sentinel payload; the worker's outer boundary (`bootstrap`, below) catches that
//! specific payload and treats it as a normal, silent shutdown rather than a user error.
//! Ordinary `?` propagation and RAII guard drops during the resulting unwind give us
//! lock-release-on-cancel for free.

use std::any::Any;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::clock::{Budget, Clock, SystemClock};
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};

/// The private panic payload used to unwind a worker out of a safe point on cancellation.
///
/// Never exposed outside this crate: user code cannot construct or catch it deliberately,
/// which is what lets `bootstrap`'s `catch_unwind` tell a cancellation apart from a real
/// user panic just by payload type.
struct CancelSignal;

thread_local! {
    static CURRENT: RefCell<Option<Arc<Interruptible>>> = const { RefCell::new(None) };
}

/// Returns the shared state of the worker the calling thread is running as, if any.
pub(crate) fn current() -> Option<Arc<Interruptible>> {
    CURRENT.with(|cell| cell.borrow().clone())
}

/// The safe point: if the calling thread is a managed worker whose cancellation has been
/// requested, unwinds it right here via [`CancelSignal`]. A no-op on any other thread, or
/// on a worker that is not (yet) being stopped.
///
/// Every blocking wait in this crate calls this once per slice it spends waiting, so a
/// cancelled worker never blocks longer than one granularity slice past the point `stop`
/// observed it was safe to proceed.
pub(crate) fn check_cancelled() {
    if let Some(shared) = current() {
        if shared.stopping.load(Ordering::SeqCst) {
            std::panic::panic_any(CancelSignal);
        }
    }
}

/// A one-shot, multi-waiter "has this worker finished" flag.
#[derive(Debug, Default)]
pub(crate) struct DoneSignal {
    done: Mutex<bool>,
    cond: Condvar,
}

impl DoneSignal {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn signal(&self) {
        let mut done = self.done.lock().expect("done mutex poisoned");
        *done = true;
        self.cond.notify_all();
    }

    pub(crate) fn is_done(&self) -> bool {
        *self.done.lock().expect("done mutex poisoned")
    }

    /// Blocks up to `timeout` for `signal` to have been called. Returns whether it has.
    pub(crate) fn wait(&self, clock: &dyn Clock, timeout: Duration) -> bool {
        let mut budget = Budget::new(clock, timeout, timeout);
        let mut guard = self.done.lock().expect("done mutex poisoned");
        loop {
            if *guard {
                return true;
            }
            let Some(slice) = budget.next_slice(clock) else {
                return false;
            };
            let (g, _) = self
                .cond
                .wait_timeout(guard, slice)
                .expect("done mutex poisoned");
            guard = g;
        }
    }

    /// Blocks indefinitely for `signal` to have been called.
    pub(crate) fn wait_indefinitely(&self) {
        let mut guard = self.done.lock().expect("done mutex poisoned");
        while !*guard {
            guard = self.cond.wait(guard).expect("done mutex poisoned");
        }
    }
}

/// The reentrant, shared "shield lock" described by the data model: a depth counter that
/// [`Shield`][crate::Shield] increments on entry and decrements on exit, and that `stop`
/// must observe at zero before it is allowed to request cancellation.
#[derive(Debug, Default)]
pub(crate) struct ShieldLock {
    depth: Mutex<u32>,
    cond: Condvar,
}

impl ShieldLock {
    fn new() -> Self {
        Self {
            depth: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn enter(&self) {
        let mut depth = self.depth.lock().expect("shield lock poisoned");
        *depth += 1;
    }

    pub(crate) fn exit(&self) {
        let mut depth = self.depth.lock().expect("shield lock poisoned");
        *depth -= 1;
        if *depth == 0 {
            self.cond.notify_all();
        }
    }

    /// Blocks until no [`Shield`][crate::Shield] is active, up to `budget`, then returns a
    /// guard that keeps it that way until dropped — holding the returned guard blocks any
    /// new `Shield::new()` on this worker from proceeding past its own `enter`.
    fn wait_for_zero<'a>(
        &'a self,
        clock: &dyn Clock,
        budget: &mut Budget,
    ) -> Result<MutexGuard<'a, u32>> {
        let mut guard = self.depth.lock().expect("shield lock poisoned");
        loop {
            if *guard == 0 {
                return Ok(guard);
            }
            let slice = budget.next_slice(clock).ok_or(Error::Timeout)?;
            let (g, _) = self
                .cond
                .wait_timeout(guard, slice)
                .expect("shield lock poisoned");
            guard = g;
        }
    }
}

/// The shared state behind one managed worker thread: the "InterruptibleThread" of the
/// data model. Held by both the public [`Thread`][crate::Thread] handle and, via
/// thread-local storage, by the worker thread itself.
#[derive(Debug)]
pub(crate) struct Interruptible {
    pub(crate) label: String,
    stopping: AtomicBool,
    done: DoneSignal,
    shield: ShieldLock,
    stop_in_progress: Mutex<()>,
    clock: SystemClock,
    config: RuntimeConfig,
    thread_id: Mutex<Option<std::thread::ThreadId>>,
    outcome: Mutex<Option<Result<()>>>,
}

impl Interruptible {
    pub(crate) fn new(label: String, config: RuntimeConfig) -> Arc<Self> {
        Arc::new(Self {
            label,
            stopping: AtomicBool::new(false),
            done: DoneSignal::new(),
            shield: ShieldLock::new(),
            stop_in_progress: Mutex::new(()),
            clock: SystemClock,
            config,
            thread_id: Mutex::new(None),
            outcome: Mutex::new(None),
        })
    }

    pub(crate) fn config(&self) -> RuntimeConfig {
        self.config
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        &self.clock
    }

    pub(crate) fn shield_lock(&self) -> &ShieldLock {
        &self.shield
    }

    pub(crate) fn done_signal(&self) -> &DoneSignal {
        &self.done
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.is_done()
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.is_done()
    }

    fn set_worker_thread_id(&self, id: std::thread::ThreadId) {
        *self.thread_id.lock().expect("thread id mutex poisoned") = Some(id);
    }

    fn is_current_thread(&self) -> bool {
        *self.thread_id.lock().expect("thread id mutex poisoned") == Some(std::thread::current().id())
    }

    pub(crate) fn take_outcome(&self) -> Option<Result<()>> {
        self.outcome.lock().expect("outcome mutex poisoned").take()
    }

    /// Requests cancellation of the worker this state belongs to, waiting up to `timeout`
    /// for it to finish. See [`crate::Thread::stop`] for the full contract.
    pub(crate) fn stop(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        if self.is_current_thread() {
            // Self-stop: convert directly into a local unwind, bypassing the shield/idempotency
            // dance entirely, since there is no other thread to coordinate with.
            std::panic::panic_any(CancelSignal);
        }

        if self.is_done() {
            return Ok(());
        }

        let Ok(_in_progress) = self.stop_in_progress.try_lock() else {
            // Another `stop` call is already driving cancellation for this worker.
            return Ok(());
        };

        if self.is_done() {
            return Ok(());
        }

        let clock = self.clock();
        let mut budget = Budget::new(clock, timeout, self.config.granularity());

        // Acquiring this guard waits for every active Shield on the worker to release, and
        // then blocks any new Shield from starting until it is dropped at the end of this
        // call.
        let _shield_guard = self.shield.wait_for_zero(clock, &mut budget)?;

        self.stopping.store(true, Ordering::SeqCst);

        let remaining = budget.next_slice(clock).unwrap_or(Duration::ZERO);
        if self.done.wait(clock, remaining) {
            Ok(())
        } else {
            Err(Error::Timeout)
        }
    }

    /// Blocks up to `timeout` for the worker to finish, without requesting cancellation.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        self.done.wait(&self.clock, timeout)
    }

    /// Blocks indefinitely for the worker to finish, without requesting cancellation.
    pub(crate) fn wait_indefinitely(&self) {
        self.done.wait_indefinitely();
    }
}

/// Installs `shared` as the calling thread's current worker context, runs `body`, then
/// tears the context down. This is the worker's entire lifecycle, including the `finally`
/// clause the data model describes: stopping is always set, the done flag is always set
/// exactly once, and any outcome other than [`CancelSignal`] is recorded for the caller.
pub(crate) fn bootstrap<F>(
    shared: Arc<Interruptible>,
    body: F,
    on_finished: Option<Box<dyn FnOnce(Option<String>) + Send>>,
) where
    F: FnOnce() + std::panic::UnwindSafe,
{
    shared.set_worker_thread_id(std::thread::current().id());
    CURRENT.with(|cell| *cell.borrow_mut() = Some(Arc::clone(&shared)));

    let result = std::panic::catch_unwind(body);

    // "In the finally clause, ... sets stopping, sets done."
    shared.stopping.store(true, Ordering::SeqCst);

    let outcome: Result<()> = match result {
        Ok(()) => Ok(()),
        Err(payload) => {
            if is_cancel_signal(&payload) {
                tracing::debug!(worker = %shared.label, "worker unwound on cancellation");
                Ok(())
            } else {
                let error = Error::from_panic(payload);
                tracing::warn!(worker = %shared.label, error = %error, "worker failed");
                Err(error)
            }
        }
    };

    let failure_message = outcome.as_ref().err().map(ToString::to_string);
    *shared.outcome.lock().expect("outcome mutex poisoned") = Some(outcome);

    if let Some(on_finished) = on_finished {
        on_finished(failure_message);
    }

    shared.done.signal();
    CURRENT.with(|cell| *cell.borrow_mut() = None);
    tracing::trace!(worker = %shared.label, "worker done");
}

/// Whether a caught panic payload is this crate's private cancellation sentinel rather than a
/// real user panic. [`dispatch`][crate::dispatch] needs this too, to tell a job that unwound on
/// cancellation apart from one that failed, without exposing [`CancelSignal`] itself.
pub(crate) fn is_cancel_signal(payload: &Box<dyn Any + Send>) -> bool {
    payload.is::<CancelSignal>()
}
