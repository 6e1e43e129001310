// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any::Any;
use std::fmt;

use thiserror::Error;

/// A specialized `Result` type for `marshal_rt` operations that return an
/// [`Error`][enum@Error] on failure.
pub type Result<T> = std::result::Result<T, Error>;

/// An error originating in `marshal_rt`.
///
/// This is an umbrella type for everything that can go wrong while coordinating
/// interruptible threads, including programming errors (misuse of the API) and
/// the structured results of cancellation and failure propagation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A [`Channel`][crate::Channel] operation was attempted after `close()`.
    #[error("channel is closed")]
    Closed,

    /// A blocking `dispatch()` call was made from the `DispatchQueue`'s own worker thread.
    ///
    /// This would deadlock (the worker would be waiting on itself), so it is rejected
    /// immediately instead. Use `safe_dispatch()` from code that may run on the queue's
    /// worker, or restructure the call to avoid the recursion.
    #[error("cannot dispatch onto a queue from its own worker thread")]
    IllegalDispatch,

    /// A cancellation or acquisition budget was exhausted before the operation completed.
    #[error("operation timed out")]
    Timeout,

    /// An API that requires a managed worker context was called outside of one.
    ///
    /// [`Shield`][crate::Shield] and the thread-local-aware parts of
    /// [`sleep`][crate::sleep] require that the calling thread was started via
    /// [`thread::spawn`][crate::thread::spawn] or [`ThreadGroup::run`][crate::ThreadGroup::run].
    #[error("{0} requires a thread managed by marshal_rt")]
    Misuse(&'static str),

    /// One or more workers in a [`ThreadGroup`][crate::ThreadGroup] failed.
    ///
    /// Carries every captured failure alongside the name or index of the worker that
    /// raised it, in the order the failures were observed.
    #[error("{0}")]
    Aggregate(#[from] AggregateError),

    /// A worker panicked with something other than the internal cancellation signal.
    ///
    /// The payload is whatever `std::panic::catch_unwind` captured; most panics carry a
    /// `&'static str` or `String` message, which [`Error::panic_message`] extracts when
    /// possible.
    #[error("worker panicked: {0}")]
    Panic(PanicPayload),
}

impl Error {
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::Panic(PanicPayload(payload))
    }

    /// Returns the panic message as a string, if the payload was a `&'static str` or
    /// `String` (the overwhelming majority of panics, including every `panic!`,
    /// `assert!`, and `unwrap()` call site).
    #[must_use]
    pub fn panic_message(&self) -> Option<&str> {
        match self {
            Self::Panic(payload) => payload.message(),
            _ => None,
        }
    }
}

/// A type-erased panic payload, kept `Send` so it can cross the worker→caller boundary.
pub struct PanicPayload(Box<dyn Any + Send>);

impl PanicPayload {
    fn message(&self) -> Option<&str> {
        if let Some(s) = self.0.downcast_ref::<&'static str>() {
            Some(s)
        } else {
            self.0.downcast_ref::<String>().map(String::as_str)
        }
    }
}

impl fmt::Debug for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PanicPayload")
            .field(&self.message().unwrap_or("<non-string panic payload>"))
            .finish()
    }
}

impl fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message().unwrap_or("<non-string panic payload>"))
    }
}

/// Identifies a single failed worker within a [`ThreadGroup`][crate::ThreadGroup].
#[derive(Debug, Clone)]
pub struct FailedWorker {
    /// The worker's name, if one was given, otherwise its spawn index within the group.
    pub label: String,

    /// The error the worker raised, rendered to a string (the underlying [`Error`] is
    /// not `Clone`, and an [`AggregateError`] may be cloned freely for reporting).
    pub message: String,
}

/// Carries every failure observed by a [`ThreadGroup`][crate::ThreadGroup] before it
/// cancelled its remaining workers.
///
/// At least one entry is always present — an empty `AggregateError` is never constructed.
#[derive(Debug, Clone, Error)]
#[error("{} worker(s) failed: {}", self.failures.len(), Self::render(&self.failures))]
pub struct AggregateError {
    failures: Vec<FailedWorker>,
}

impl AggregateError {
    pub(crate) fn new(failures: Vec<FailedWorker>) -> Self {
        debug_assert!(!failures.is_empty(), "an aggregate error must carry at least one failure");
        Self { failures }
    }

    /// The individual failures, in the order they were observed.
    #[must_use]
    pub fn failures(&self) -> &[FailedWorker] {
        &self.failures
    }

    fn render(failures: &[FailedWorker]) -> String {
        failures
            .iter()
            .map(|f| format!("[{}] {}", f.label, f.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}
