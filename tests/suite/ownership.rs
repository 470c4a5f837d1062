//! `Owned` under contention: exclusion, transfer, extraction, timeouts.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use tether_core::{BorrowKind, BorrowState, OwnershipViolation, TetherError, ThreadKey};

use crate::common::{coordinator, instrumented};

#[test]
fn writers_and_readers_never_overlap() {
    const WRITERS: usize = 4;
    const READERS: usize = 4;
    const ITERATIONS: usize = 250;

    let coord = coordinator();
    let counter = coord.owned(0_usize);
    let writers_inside = AtomicUsize::new(0);
    let readers_inside = AtomicUsize::new(0);

    thread::scope(|s| {
        for _ in 0..WRITERS {
            s.spawn(|| {
                for _ in 0..ITERATIONS {
                    let mut handle = counter.borrow_mut();
                    assert_eq!(writers_inside.fetch_add(1, Ordering::SeqCst), 0);
                    assert_eq!(readers_inside.load(Ordering::SeqCst), 0);
                    *handle += 1;
                    writers_inside.fetch_sub(1, Ordering::SeqCst);
                }
            });
        }
        for _ in 0..READERS {
            s.spawn(|| {
                for _ in 0..ITERATIONS {
                    let handle = counter.borrow();
                    readers_inside.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(writers_inside.load(Ordering::SeqCst), 0);
                    let _ = *handle;
                    readers_inside.fetch_sub(1, Ordering::SeqCst);
                }
            });
        }
    });

    assert_eq!(*counter.borrow(), WRITERS * ITERATIONS);
    assert!(counter.state().is_unborrowed());
}

#[test]
fn failed_try_borrow_has_no_side_effects() {
    let coord = instrumented();
    let owned = coord.owned(1);
    let reader = owned.borrow();
    let context = coord.registry().get_current_context();

    let err = owned.try_borrow_mut().expect_err("reader active");
    assert_eq!(err.requested, BorrowKind::Exclusive);
    assert_eq!(err.lock, owned.id());
    assert_eq!(owned.state().borrow_count(), 1);
    assert_eq!(context.active_borrows().len(), 1);

    let snapshot = coord.diagnostics().snapshot();
    assert_eq!(snapshot.try_failures, 1);
    assert_eq!(snapshot.contentions, 0);
    drop(reader);
}

#[test]
fn former_owner_gets_use_after_transfer() {
    let coord = coordinator();
    let owned = Arc::new(coord.owned(String::from("doc")));
    let (key_tx, key_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();

    let worker = {
        let owned = Arc::clone(&owned);
        thread::spawn(move || {
            key_tx.send(ThreadKey::current()).expect("send key");
            go_rx.recv().expect("wait for transfer");
            owned.borrow_mut().push('!');
            // Hand it back so the original thread may act as owner again.
            owned.transfer(ThreadKey::from_raw(0))
        })
    };

    let worker_key = key_rx.recv().expect("worker key");
    let original = ThreadKey::current();
    owned.transfer(worker_key).expect("owner transfers");

    let err = owned.transfer(original).expect_err("no longer owner");
    match err {
        TetherError::UseAfterTransfer(e) => {
            assert_eq!(e.previous_owner, original);
            assert_eq!(e.current_owner, worker_key);
            assert_eq!(e.lock, owned.id());
        }
        other => panic!("unexpected error: {other}"),
    }

    go_tx.send(()).expect("release worker");
    worker
        .join()
        .expect("worker")
        .expect("new owner may transfer");
    assert_eq!(owned.owner(), ThreadKey::from_raw(0));
    assert_eq!(*owned.borrow(), "doc!");
}

#[test]
fn ownership_returned_to_former_owner_is_usable_again() {
    let coord = coordinator();
    let owned = Arc::new(coord.owned(0));
    let original = ThreadKey::current();

    let (key_tx, key_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let worker = {
        let owned = Arc::clone(&owned);
        thread::spawn(move || {
            key_tx.send(ThreadKey::current()).expect("send key");
            go_rx.recv().expect("wait");
            owned.transfer(original)
        })
    };

    owned
        .transfer(key_rx.recv().expect("worker key"))
        .expect("owner transfers");
    go_tx.send(()).expect("go");
    worker.join().expect("worker").expect("hand back");

    assert_eq!(owned.owner(), original);
    owned
        .transfer(original)
        .expect("owner again, so transfer works");
}

#[test]
fn non_owner_cannot_extract() {
    let coord = coordinator();
    let owned = coord.owned(42);
    let owner = owned.owner();

    let (owned, caller) = thread::spawn(move || {
        let err = owned.into_inner().expect_err("not the owner");
        let TetherError::Ownership(e) = err.error().clone() else {
            panic!("expected an ownership violation");
        };
        assert_eq!(e.violation, OwnershipViolation::NotOwner);
        assert_eq!(e.owner, owner);
        (err.into_owned(), e.caller)
    })
    .join()
    .expect("worker");

    assert_ne!(caller, owner);
    assert_eq!(owned.into_inner().expect("owner extracts"), 42);
}

#[test]
fn timeout_leaves_state_untouched() {
    let coord = instrumented();
    let owned = coord.owned(());
    let (held_tx, held_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    thread::scope(|s| {
        let owned = &owned;
        s.spawn(move || {
            let _handle = owned.borrow_mut();
            held_tx.send(owned.state()).expect("signal");
            done_rx.recv().expect("wait");
        });

        let held = held_rx.recv().expect("writer holds");
        let err = owned
            .borrow_timeout(Duration::from_millis(30))
            .expect_err("writer active");
        assert_eq!(err.requested, BorrowKind::Shared);
        assert!(err.waited >= Duration::from_millis(30));
        assert_eq!(owned.state(), held);
        done_tx.send(()).expect("release");
    });

    let snapshot = coord.diagnostics().snapshot();
    assert_eq!(snapshot.timeouts, 1);
    assert_eq!(snapshot.contentions, 1);
    assert!(owned.state().is_unborrowed());
}

#[test]
fn blocked_borrow_proceeds_after_release_and_counts_contention() {
    let coord = instrumented();
    let owned = coord.owned(0);
    let (held_tx, held_rx) = mpsc::channel();

    thread::scope(|s| {
        let owned = &owned;
        s.spawn(move || {
            let mut handle = owned.borrow_mut();
            held_tx.send(()).expect("signal");
            thread::sleep(Duration::from_millis(50));
            *handle = 9;
        });
        held_rx.recv().expect("writer holds");
        assert_eq!(*owned.borrow(), 9);
    });

    let snapshot = coord.diagnostics().snapshot();
    assert_eq!(snapshot.contentions, 1);
    assert_eq!(snapshot.wait_time.count, 1);
    assert_eq!(snapshot.exclusive_borrows, 1);
    assert_eq!(snapshot.shared_borrows, 1);
}

#[test]
fn panicking_borrower_still_releases() {
    let coord = coordinator();
    let owned = coord.owned(vec![0]);

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut handle = owned.borrow_mut();
        handle.push(1);
        panic!("borrower failed");
    }));

    assert!(result.is_err());
    assert_eq!(owned.state(), BorrowState::Unborrowed);
    assert_eq!(*owned.borrow(), vec![0, 1]);
}
