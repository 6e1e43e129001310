// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use marshal_rt::{queued_dispatch, queued_dispatcher, DispatchQueue};
use support::execute_or_abandon;

queued_dispatcher! {
    mod bank_account {
        pub struct Account {
            balance: i64,
        }

        impl Account {
            pub fn new(opening_balance: i64) -> Self {
                Self {
                    balance: opening_balance,
                }
            }

            pub fn deposit(&mut self, amount: i64) -> i64 {
                self.balance += amount;
                self.balance
            }

            pub fn withdraw(&mut self, amount: i64) -> Result<i64, &'static str> {
                if amount > self.balance {
                    return Err("insufficient funds");
                }
                self.balance -= amount;
                Ok(self.balance)
            }

            pub fn balance(&self) -> i64 {
                self.balance
            }
        }
    }
}

#[test]
fn queued_dispatcher_serializes_concurrent_deposits() {
    execute_or_abandon(|| {
        let account = Arc::new(bank_account::Account::new(0));
        let barrier = Arc::new(Barrier::new(21));

        let workers: Vec<_> = (0..20)
            .map(|_| {
                let account = Arc::clone(&account);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    account.deposit(1).unwrap();
                })
            })
            .collect();

        barrier.wait();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(account.balance().unwrap(), 20);
    })
    .unwrap();
}

#[test]
fn queued_dispatcher_reports_the_wrapped_methods_own_error() {
    execute_or_abandon(|| {
        let account = bank_account::Account::new(5);
        assert_eq!(account.withdraw(10).unwrap(), Err("insufficient funds"));
        assert_eq!(account.withdraw(5).unwrap(), Ok(0));
    })
    .unwrap();
}

#[test]
fn queued_dispatch_free_function_routes_through_a_shared_queue() {
    execute_or_abandon(|| {
        let queue = Arc::new(DispatchQueue::new());
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            queued_dispatch(&queue, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 10);
        queue.stop(Duration::from_secs(5)).unwrap();
    })
    .unwrap();
}
