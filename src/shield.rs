// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A scoped critical section that defers cancellation of the current worker.

use crate::error::{Error, Result};
use crate::thread::interruptible;

/// Scoped acquisition of the current worker's shield lock.
///
/// While any `Shield` is active on a worker, [`Thread::stop`][crate::Thread::stop] blocks
/// in its shield-acquisition step; if its timeout elapses first, `stop` fails with
/// [`Error::Timeout`] and the worker continues running. Shields nest freely on the same
/// worker — the lock is a depth counter, not a binary flag.
///
/// Constructing a `Shield` outside a thread managed by [`thread::spawn`][crate::thread::spawn]
/// or [`ThreadGroup::run`][crate::ThreadGroup::run] fails with [`Error::Misuse`].
///
/// ```
/// use marshal_rt::{thread, Shield};
///
/// let worker = thread::spawn(|| {
///     let _section = Shield::new().unwrap();
///     // stop() called on this worker now blocks until this Shield is dropped.
/// });
/// worker.join().unwrap();
/// ```
#[derive(Debug)]
pub struct Shield {
    _private: (),
}

impl Shield {
    /// Enters the current worker's critical section, deferring its cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Misuse`] if the calling thread is not a managed worker.
    pub fn new() -> Result<Self> {
        let shared = interruptible::current().ok_or(Error::Misuse("Shield"))?;
        shared.shield_lock().enter();
        Ok(Self { _private: () })
    }
}

impl Drop for Shield {
    fn drop(&mut self) {
        if let Some(shared) = interruptible::current() {
            shared.shield_lock().exit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn shield_outside_worker_is_misuse() {
        assert!(matches!(Shield::new(), Err(Error::Misuse(_))));
    }

    #[test]
    fn shield_blocks_stop_until_timeout() {
        let ready = std::sync::Arc::new(std::sync::Barrier::new(2));
        let worker_ready = std::sync::Arc::clone(&ready);

        let worker = crate::thread::spawn(move || {
            let _section = Shield::new().unwrap();
            worker_ready.wait();
            std::thread::sleep(Duration::from_secs(100));
        });

        ready.wait();
        let result = worker.stop(Duration::from_millis(50));
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(worker.running());
    }
}
