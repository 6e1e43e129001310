// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A FIFO carrier between workers with close semantics and a `get_first` race combinator.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::clock::{Budget, SystemClock};
use crate::error::{Error, Result};
use crate::group::ThreadGroup;
use crate::thread::interruptible;

struct State<T> {
    queue: VecDeque<T>,
    closed: bool,
}

/// A mapping-free FIFO queue of `T` with `close()` semantics and an optional `on_put` hook.
///
/// `get()` is a cancellation safe point: a worker blocked on an open, empty channel unwinds
/// on cancellation the same as any other blocking wait in this crate.
pub struct Channel<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
    // `RefUnwindSafe` is spelled out explicitly because trait objects don't inherit auto
    // traits from their bound; without it, a `Channel` with an `on_put` hook configured would
    // not be `UnwindSafe`, which would stop one from being moved into a `ThreadGroup::run`
    // closure (see `Channel::get_first`).
    on_put: Option<Box<dyn Fn() + Send + Sync + std::panic::RefUnwindSafe>>,
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("channel mutex poisoned");
        f.debug_struct("Channel")
            .field("len", &state.queue.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Channel<T> {
    /// Creates an empty, open channel with no `on_put` observer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
            on_put: None,
        }
    }

    /// Creates an empty, open channel that invokes `on_put` after every successful `put`.
    pub fn with_on_put<F>(on_put: F) -> Self
    where
        F: Fn() + Send + Sync + std::panic::RefUnwindSafe + 'static,
    {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
            on_put: Some(Box::new(on_put)),
        }
    }

    /// Appends `v` to the channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] if the channel has been closed.
    pub fn put(&self, v: T) -> Result<()> {
        {
            let mut state = self.state.lock().expect("channel mutex poisoned");
            if state.closed {
                return Err(Error::Closed);
            }
            state.queue.push_back(v);
        }
        self.cond.notify_all();
        if let Some(on_put) = &self.on_put {
            on_put();
        }
        Ok(())
    }

    /// Blocks until an item is available, returning it. On a closed, empty channel,
    /// returns [`Error::Closed`] instead of blocking.
    pub fn get(&self) -> Result<T> {
        let granularity = interruptible::current()
            .map(|shared| shared.config().granularity())
            .unwrap_or(Duration::from_millis(10));
        let clock = SystemClock;
        let mut budget = Budget::unbounded(granularity);

        let mut state = self.state.lock().expect("channel mutex poisoned");
        loop {
            if let Some(item) = state.queue.pop_front() {
                return Ok(item);
            }
            if state.closed {
                return Err(Error::Closed);
            }
            interruptible::check_cancelled();
            let slice = budget.next_slice(&clock).unwrap_or(granularity);
            let (s, _) = self
                .cond
                .wait_timeout(state, slice)
                .expect("channel mutex poisoned");
            state = s;
        }
    }

    /// Idempotently closes the channel, waking every blocked `get` with [`Error::Closed`].
    pub fn close(&self) {
        let mut state = self.state.lock().expect("channel mutex poisoned");
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        self.cond.notify_all();
    }

    /// Whether `close()` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("channel mutex poisoned").closed
    }

    /// Whether the channel currently holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().expect("channel mutex poisoned").queue.is_empty()
    }

    /// The number of items currently enqueued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().expect("channel mutex poisoned").queue.len()
    }

    /// Drains every item currently enqueued without blocking, even on an open channel.
    ///
    /// This is the non-blocking iteration the data model describes: it returns only what
    /// is already present, it never waits for more to arrive.
    #[must_use]
    pub fn drain_available(&self) -> Vec<T> {
        let mut state = self.state.lock().expect("channel mutex poisoned");
        state.queue.drain(..).collect()
    }
}

impl<T: Send + 'static> Channel<T> {
    /// Races `fns` against each other in a [`ThreadGroup`], returning the first value any
    /// of them produces on a shared channel.
    ///
    /// Every function is spawned as a worker that receives a reference to the shared
    /// channel; as soon as one puts a value, the others are cancelled. By the time this
    /// returns (or fails), every spawned worker has finished and released any
    /// [`Shield`][crate::Shield]/[`Lock`][crate::sync::Lock] it held.
    ///
    /// # Errors
    ///
    /// If any function raises before any value is produced, the aggregated error from the
    /// underlying [`ThreadGroup::scope`] propagates.
    pub fn get_first<F>(fns: Vec<F>) -> Result<T>
    where
        F: FnOnce(&Channel<T>) + Send + std::panic::UnwindSafe + 'static,
    {
        let channel: std::sync::Arc<Channel<T>> = std::sync::Arc::new(Channel::new());

        ThreadGroup::scope(|group| {
            for f in fns {
                let channel_for_worker = std::sync::Arc::clone(&channel);
                let group_for_worker = group.clone();
                group.run(move || {
                    f(&channel_for_worker);
                    group_for_worker.stop();
                });
            }
        })?;

        channel.get()
    }
}
