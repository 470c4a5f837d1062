//! Contention workloads run by `tether stress` and `tether deadlock-demo`.

use std::sync::Barrier;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use tracing::info;

use tether_core::{Coordinator, DeadlockReport};

#[derive(Debug, Clone, Copy)]
pub struct StressPlan {
    pub writers: usize,
    pub readers: usize,
    pub iterations: usize,
}

impl StressPlan {
    /// Total writes the plan performs, or an error if that overflows `usize`.
    pub fn expected_writes(self) -> Result<usize> {
        self.writers.checked_mul(self.iterations).with_context(|| {
            format!(
                "{} writers x {} iterations overflows the write counter",
                self.writers, self.iterations
            )
        })
    }
}

/// Writers bump an `Owned` counter while readers watch it.
///
/// Fails if the final count is off, or if a reader ever saw the value go backwards.
pub fn owned_counter(coord: &Coordinator, plan: StressPlan) -> Result<()> {
    let expected = plan.expected_writes()?;
    let counter = coord.owned(0_usize);
    let regressions = AtomicUsize::new(0);

    thread::scope(|s| {
        for _ in 0..plan.writers {
            s.spawn(|| {
                for _ in 0..plan.iterations {
                    *counter.borrow_mut() += 1;
                }
            });
        }
        for _ in 0..plan.readers {
            s.spawn(|| {
                let mut last = 0;
                for _ in 0..plan.iterations {
                    let seen = *counter.borrow();
                    if seen < last {
                        regressions.fetch_add(1, Ordering::Relaxed);
                    }
                    last = seen;
                }
            });
        }
    });

    let total = *counter.borrow();
    ensure!(total == expected, "owned counter ended at {total}, expected {expected}");
    let regressions = regressions.load(Ordering::Relaxed);
    ensure!(regressions == 0, "readers saw the counter go backwards {regressions} times");
    info!(total, "Owned counter workload finished");
    Ok(())
}

/// Writers update both halves of a `SharedRef` pair; readers check they agree.
pub fn shared_pair(coord: &Coordinator, plan: StressPlan) -> Result<()> {
    let expected = plan.expected_writes()?;
    let pair = coord.shared((0_usize, 0_usize));
    let torn = AtomicUsize::new(0);

    thread::scope(|s| {
        for _ in 0..plan.writers {
            let pair = pair.clone();
            s.spawn(move || {
                for _ in 0..plan.iterations {
                    let mut guard = pair.write();
                    guard.0 += 1;
                    guard.1 += 1;
                }
            });
        }
        for _ in 0..plan.readers {
            let pair = pair.clone();
            let torn = &torn;
            s.spawn(move || {
                for _ in 0..plan.iterations {
                    let guard = pair.read();
                    if guard.0 != guard.1 {
                        torn.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });

    let torn = torn.load(Ordering::Relaxed);
    ensure!(torn == 0, "readers saw {torn} half-written pairs");
    let (left, right) = *pair.read();
    ensure!(
        left == expected && right == left,
        "shared pair ended at ({left}, {right}), expected {expected} on both sides"
    );
    ensure!(pair.ref_count() == 1, "clones outlived the workload");
    info!(total = left, "Shared pair workload finished");
    Ok(())
}

/// Two threads take two values in opposite orders.
///
/// Each second request carries `patience` as its timeout so the demo always ends.
/// Returns whatever the wait-for graph reported along the way.
pub fn lock_order_inversion(coord: &Coordinator, patience: Duration) -> Vec<DeadlockReport> {
    let first = coord.owned("first");
    let second = coord.owned("second");
    let both_hold = Barrier::new(2);

    thread::scope(|s| {
        s.spawn(|| {
            let _held = first.borrow_mut();
            both_hold.wait();
            if second.borrow_mut_timeout(patience).is_err() {
                info!(lock = %second.id(), "Gave up waiting");
            }
        });
        s.spawn(|| {
            let _held = second.borrow_mut();
            both_hold.wait();
            if first.borrow_mut_timeout(patience).is_err() {
                info!(lock = %first.id(), "Gave up waiting");
            }
        });
    });

    coord.diagnostics().deadlock_reports()
}
