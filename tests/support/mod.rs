// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shared test scaffolding, grounded on `oxidizer_testing`'s watchdog pattern.

use std::sync::mpsc;
use std::sync::Once;
use std::thread;
use std::time::Duration;

/// If something does not happen in a test within this time, the test fails rather than hangs
/// forever. Conservative on purpose — this only exists to break out of deadlocks and stuck
/// cancellation, not to bound anything that is expected to take a while.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

static LOGGING_INITIALIZER: Once = Once::new();

/// Enables logging of this crate's `tracing` events to the terminal for the rest of the test
/// process, controlled by `RUST_LOG` (defaults to `info`). Global, process-wide state —
/// `Once`-guarded so calling it from every test is harmless.
fn ensure_logging_initialized() {
    LOGGING_INITIALIZER.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Runs `f` on a background thread and abandons it (returning `None`) if it does not complete
/// within [`TEST_TIMEOUT`].
///
/// Every integration test that exercises blocking runtime behavior (`stop`, `wait_for`, a
/// dispatch queue drain) goes through this instead of calling the blocking API directly, so a
/// regression that hangs forever fails the test suite instead of the CI job.
#[allow(dead_code)]
pub fn execute_or_abandon<F, R>(f: F) -> Option<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    ensure_logging_initialized();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let result = f();
        let _ = tx.send(result);
    });
    rx.recv_timeout(TEST_TIMEOUT).ok()
}
