// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use marshal_rt::thread;
use support::execute_or_abandon;

#[test]
fn fan_out_counter_runs_every_worker_exactly_once() {
    execute_or_abandon(|| {
        let counter = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(11));

        let workers: Vec<_> = (0..10)
            .map(|_| {
                let counter = Arc::clone(&counter);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        barrier.wait();
        for worker in &workers {
            worker.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 10);
    })
    .unwrap();
}

#[test]
fn spawned_worker_is_running_until_it_finishes() {
    execute_or_abandon(|| {
        let gate = Arc::new(Barrier::new(2));
        let worker_gate = Arc::clone(&gate);

        let worker = thread::spawn(move || {
            worker_gate.wait();
        });

        assert!(worker.running());
        gate.wait();
        assert!(worker.wait(Duration::from_secs(5)));
        assert!(worker.done());
    })
    .unwrap();
}

#[test]
fn current_returns_none_outside_a_managed_worker() {
    assert!(thread::current().is_none());
}

#[test]
fn current_returns_a_handle_inside_a_managed_worker() {
    execute_or_abandon(|| {
        let worker = thread::spawn(|| {
            assert!(thread::current().is_some());
        });
        worker.join().unwrap();
    })
    .unwrap();
}
