// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

mod support;

use std::sync::{Arc, Barrier};
use std::time::Duration;

use marshal_rt::sync::AbortConcurrentCalls;
use support::execute_or_abandon;

#[test]
fn two_independent_guards_do_not_interfere_with_each_other() {
    execute_or_abandon(|| {
        let guard_a = Arc::new(AbortConcurrentCalls::new());
        let guard_b = Arc::new(AbortConcurrentCalls::new());
        let barrier = Arc::new(Barrier::new(2));

        let ga = Arc::clone(&guard_a);
        let ba = Arc::clone(&barrier);
        let first = std::thread::spawn(move || {
            ga.call(|| {
                ba.wait();
                std::thread::sleep(Duration::from_millis(40));
                "a"
            })
        });

        barrier.wait();
        // guard_b is independent of guard_a, so a call through it is never dropped, even
        // while guard_a has a call in flight.
        let through_b = guard_b.call(|| "b");

        assert_eq!(through_b, Some("b"));
        assert_eq!(first.join().unwrap(), Some("a"));
    })
    .unwrap();
}

#[test]
fn a_guard_accepts_calls_again_once_the_in_flight_one_finishes() {
    execute_or_abandon(|| {
        let guard = AbortConcurrentCalls::new();
        assert_eq!(guard.call(|| 1), Some(1));
        assert_eq!(guard.call(|| 2), Some(2));
    })
    .unwrap();
}
