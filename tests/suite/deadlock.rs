//! Deadlock heuristic: lock-order inversions show up as reports, never as errors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use tether_core::{DeadlockReport, Owned, ThreadKey};

use crate::common::{coordinator, instrumented};

const HOLD: Duration = Duration::from_millis(300);

/// Two threads take `first` then `second` in opposite orders, with timeouts so
/// the test always finishes. Returns both thread keys.
fn invert(first: &Owned<u32>, second: &Owned<u32>) -> (ThreadKey, ThreadKey) {
    let both_hold = Barrier::new(2);
    thread::scope(|s| {
        let left = s.spawn(|| {
            let _a = first.borrow_mut();
            both_hold.wait();
            let _ = second.borrow_mut_timeout(HOLD);
            ThreadKey::current()
        });
        let right = s.spawn(|| {
            let _b = second.borrow_mut();
            both_hold.wait();
            let _ = first.borrow_mut_timeout(HOLD);
            ThreadKey::current()
        });
        (left.join().expect("left"), right.join().expect("right"))
    })
}

#[test]
fn lock_order_inversion_is_reported() {
    let coord = instrumented();
    let observed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&observed);
    coord
        .diagnostics()
        .set_deadlock_observer(Some(Arc::new(move |_report: &DeadlockReport| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

    let a = coord.owned(1);
    let b = coord.owned(2);
    let (left, right) = invert(&a, &b);

    let reports = coord.diagnostics().deadlock_reports();
    assert_eq!(reports.len(), 1, "one cycle, reported once: {reports:?}");
    let report = &reports[0];
    assert!(report.involves(left));
    assert!(report.involves(right));
    assert_eq!(report.cycle.len(), 2);
    for edge in &report.cycle {
        assert_eq!(edge.holds.len(), 1);
        assert_ne!(edge.holds[0], edge.waits_for);
        assert!([a.id(), b.id()].contains(&edge.waits_for));
    }
    assert_eq!(observed.load(Ordering::SeqCst), 1);
    assert_eq!(coord.diagnostics().snapshot().deadlocks_detected, 1);

    // Advisory only: both values are usable afterwards.
    assert!(a.state().is_unborrowed());
    assert!(b.state().is_unborrowed());
    assert_eq!(*a.borrow() + *b.borrow(), 3);
}

#[test]
fn inversion_goes_unreported_without_detection() {
    let coord = coordinator();
    let a = coord.owned(1);
    let b = coord.owned(2);
    invert(&a, &b);
    assert!(coord.diagnostics().deadlock_reports().is_empty());
    assert_eq!(coord.diagnostics().snapshot().deadlocks_detected, 0);
}

#[test]
fn reentrant_exclusive_request_is_a_self_cycle() {
    let coord = instrumented();
    let owned = coord.owned(0);
    let held = owned.borrow_mut();

    let err = owned
        .borrow_timeout(Duration::from_millis(10))
        .expect_err("same thread holds it exclusively");
    drop(held);

    let reports = coord.diagnostics().deadlock_reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].cycle.len(), 1);
    assert_eq!(reports[0].cycle[0].thread, ThreadKey::current());
    assert_eq!(reports[0].cycle[0].waits_for, err.lock);
}

#[test]
fn consistent_lock_order_never_reports() {
    let coord = instrumented();
    let a = coord.owned(0);
    let b = coord.owned(0);

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..100 {
                    let mut first = a.borrow_mut();
                    let mut second = b.borrow_mut();
                    *first += 1;
                    *second += 1;
                }
            });
        }
    });

    assert_eq!(*a.borrow(), 400);
    assert!(coord.diagnostics().deadlock_reports().is_empty());
}
