// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A structured-concurrency runtime built on top of OS threads.
//!
//! The coordination core this crate provides:
//!
//! - Cooperatively-interruptible worker threads ([`thread::spawn`], [`Thread`]), whose
//!   cancellation is delivered at well-defined safe points rather than by true asynchronous
//!   signal injection.
//! - A thread-group aggregator ([`ThreadGroup`]) that unifies lifetime and error propagation
//!   across a fan-out of workers: first failure cancels the rest, scope exit re-raises an
//!   aggregated error.
//! - Interruption-safe synchronization: a reentrant critical-section [`Shield`] that defers
//!   cancellation until it is released, and a [`sync::Lock`] wrapper whose blocking
//!   acquisition is itself a cancellation safe point.
//! - A single-writer dispatch queue ([`DispatchQueue`]) that serializes function calls onto
//!   one worker thread, plus [`queued_dispatcher!`] to route a whole type's public surface
//!   through one.
//! - Blocking primitives ([`sleep`], [`wait_for`]) that remain responsive to cancellation.
//!
//! Out of scope: multi-process supervision, preemption of CPU-bound code that never reaches a
//! safe point, dispatch-queue fairness guarantees beyond FIFO, and cross-host distribution.

mod channel;
mod clock;
mod config;
mod dispatch;
mod error;
mod group;
mod shield;
mod sleep;
pub mod sync;
pub mod thread;

pub use channel::Channel;
pub use clock::{Budget, Clock, FakeClock, SystemClock};
pub use config::RuntimeConfig;
pub use dispatch::{queued_dispatch, DispatchQueue};
pub use error::{AggregateError, Error, FailedWorker, PanicPayload, Result};
pub use group::ThreadGroup;
pub use shield::Shield;
pub use sleep::{abort_concurrent_calls, sleep, wait_for};
pub use thread::{current, spawn, spawn_with_config, CurrentThread, Thread};
