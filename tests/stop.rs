// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

mod support;

use std::sync::{Arc, Barrier};
use std::time::Duration;

use marshal_rt::{thread, Shield};
use support::execute_or_abandon;

#[test]
fn stop_unwinds_a_worker_blocked_in_sleep() {
    execute_or_abandon(|| {
        let ready = Arc::new(Barrier::new(2));
        let worker_ready = Arc::clone(&ready);

        let worker = thread::spawn(move || {
            worker_ready.wait();
            marshal_rt::sleep(Duration::from_secs(100));
        });

        ready.wait();
        worker.stop(Duration::from_secs(5)).unwrap();
        assert!(worker.done());
    })
    .unwrap();
}

#[test]
fn stop_releases_a_lock_the_worker_was_holding() {
    execute_or_abandon(|| {
        let lock = Arc::new(marshal_rt::sync::Lock::new(0));
        let ready = Arc::new(Barrier::new(2));

        let worker_lock = Arc::clone(&lock);
        let worker_ready = Arc::clone(&ready);
        let worker = thread::spawn(move || {
            let _guard = worker_lock.lock().unwrap();
            worker_ready.wait();
            marshal_rt::sleep(Duration::from_secs(100));
        });

        ready.wait();
        worker.stop(Duration::from_secs(5)).unwrap();

        // The guard the worker held must have been dropped on unwind, or this deadlocks and
        // the surrounding `execute_or_abandon` watchdog fails the test.
        let _guard = lock.lock().unwrap();
    })
    .unwrap();
}

#[test]
fn shield_defers_stop_until_released() {
    execute_or_abandon(|| {
        let ready = Arc::new(Barrier::new(2));
        let worker_ready = Arc::clone(&ready);

        let worker = thread::spawn(move || {
            let _section = Shield::new().unwrap();
            worker_ready.wait();
            std::thread::sleep(Duration::from_millis(80));
        });

        ready.wait();
        // The shield is held for 80ms; a short stop timeout must fail while it's up.
        assert!(worker.stop(Duration::from_millis(20)).is_err());
        // A longer call waits out the shield and then succeeds.
        worker.stop(Duration::from_secs(5)).unwrap();
        assert!(worker.done());
    })
    .unwrap();
}

#[test]
fn stop_on_an_already_done_worker_is_a_no_op() {
    execute_or_abandon(|| {
        let worker = thread::spawn(|| {});
        assert!(worker.wait(Duration::from_secs(5)));
        worker.stop(Duration::from_secs(1)).unwrap();
    })
    .unwrap();
}
