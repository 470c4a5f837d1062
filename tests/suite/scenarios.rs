//! End-to-end scenarios, one per documented usage example.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, mpsc};
use std::thread;
use std::time::Duration;

use tether_core::{
    AssertSend, BorrowState, Owned, OwnershipViolation, SharedRef, TetherError, ThreadKey,
    ThreadLocal, TransferPolicy,
};

use crate::common::{coordinator, never_within};

/// A writer on one thread makes `try_borrow` fail on another until it lets go.
#[test]
fn try_borrow_fails_while_another_thread_writes() {
    let coord = coordinator();
    let owned = coord.owned(5);

    let (held_tx, held_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (released_tx, released_rx) = mpsc::channel();

    thread::scope(|s| {
        let owned = &owned;
        s.spawn(move || {
            let handle = owned.borrow_mut();
            held_tx.send(()).expect("signal held");
            release_rx.recv().expect("wait for release");
            drop(handle);
            released_tx.send(()).expect("signal released");
        });
        s.spawn(move || {
            held_rx.recv().expect("writer holds");
            let err = owned.try_borrow().expect_err("writer active");
            assert!(matches!(err.state, BorrowState::Exclusive { .. }));

            release_tx.send(()).expect("let writer go");
            released_rx.recv().expect("writer released");
            assert_eq!(*owned.try_borrow().expect("free again"), 5);
        });
    });
}

/// Transfers of a value created with transfers disabled never succeed.
#[test]
fn forbidden_transfer_fails_for_everyone() {
    let coord = coordinator();
    let owned = Owned::with_policy(&coord, "x", TransferPolicy::Forbidden);

    let forbidden = |err: TetherError| match err {
        TetherError::Ownership(e) => e.violation == OwnershipViolation::TransferForbidden,
        _ => false,
    };

    assert!(forbidden(owned.transfer(ThreadKey::from_raw(u64::MAX)).expect_err("owner")));
    {
        let _reader = owned.borrow();
        assert!(forbidden(owned.transfer(ThreadKey::current()).expect_err("borrowed")));
    }
    thread::scope(|s| {
        s.spawn(|| {
            assert!(forbidden(owned.transfer(ThreadKey::current()).expect_err("non-owner")));
        });
    });
    assert_eq!(owned.owner(), ThreadKey::current());
}

/// Three handles share one count, and the hook fires once when the last goes.
#[test]
fn cleanup_hook_fires_once_after_last_clone() {
    let coord = coordinator();
    let fired = Arc::new(AtomicUsize::new(0));
    let hook_count = Arc::clone(&fired);
    let first = SharedRef::with_cleanup(&coord, vec![1, 2], move |_| {
        hook_count.fetch_add(1, Ordering::SeqCst);
    });
    let second = first.clone();
    let third = second.clone();
    assert_eq!(first.ref_count(), 3);
    assert_eq!(third.ref_count(), 3);

    let weak = first.downgrade();
    thread::spawn(move || drop(second))
        .join()
        .expect("dropper");
    drop(first);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    drop(third);

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(weak.ref_count(), 0);
}

/// Twenty concurrent readers on two threads hold a writer off until all are gone.
#[test]
fn writer_waits_for_twenty_readers() {
    let coord = coordinator();
    let owned = coord.owned(0_u32);
    let acquired = Barrier::new(3);
    let release = Barrier::new(3);
    let writer_done = AtomicBool::new(false);

    thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                let handles: Vec<_> = (0..10).map(|_| owned.borrow()).collect();
                acquired.wait();
                release.wait();
                drop(handles);
            });
        }

        acquired.wait();
        assert_eq!(
            owned.state(),
            BorrowState::Shared {
                count: NonZeroUsize::new(20).expect("non-zero")
            }
        );

        let writer = s.spawn(|| {
            *owned.borrow_mut() += 1;
            writer_done.store(true, Ordering::SeqCst);
        });
        never_within(Duration::from_millis(50), "writer ran alongside readers", || {
            writer_done.load(Ordering::SeqCst)
        });

        release.wait();
        writer.join().expect("writer");
    });

    assert!(writer_done.load(Ordering::SeqCst));
    assert_eq!(*owned.borrow(), 1);
    assert!(owned.state().is_unborrowed());
}

/// Once every strong handle is gone, a weak handle cannot bring the value back.
#[test]
fn weak_ref_cannot_upgrade_after_release() {
    let coord = coordinator();
    let strong = coord.shared(String::from("payload"));
    let weak = strong.downgrade();

    let clone = weak.upgrade().expect("still alive");
    assert_eq!(strong.ref_count(), 2);
    drop(clone);
    drop(strong);

    assert!(weak.upgrade().is_none());
    assert_eq!(weak.ref_count(), 0);
}

#[test]
fn thread_local_values_are_private_to_each_thread() {
    let local = Arc::new(ThreadLocal::new(Vec::<ThreadKey>::new));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let local = Arc::clone(&local);
            thread::spawn(move || {
                local.get_or_init(Vec::new);
                let mine: *const Vec<ThreadKey> = local.get();
                assert!(std::ptr::eq(mine, local.get()));
                mine as usize
            })
        })
        .collect();
    let mut addresses: Vec<usize> = workers
        .into_iter()
        .map(|worker| worker.join().expect("worker"))
        .collect();
    addresses.sort_unstable();
    addresses.dedup();

    assert_eq!(addresses.len(), 4);
    assert_eq!(local.len(), 4);
    assert!(local.try_get().is_none());
}

/// An owner hands its value to a worker, which becomes the owner and unwraps it.
#[test]
fn ownership_moves_with_the_value() {
    let coord = coordinator();
    let owned = coord.owned(vec![1, 2, 3]);
    let (key_tx, key_rx) = mpsc::channel();
    let (value_tx, value_rx) = mpsc::channel::<AssertSend<Owned<Vec<i32>>>>();

    let worker = thread::spawn(move || {
        key_tx.send(ThreadKey::current()).expect("send key");
        let owned = value_rx.recv().expect("receive value").into_inner();
        owned.into_inner().map_err(|err| err.error().clone())
    });

    let worker_key = key_rx.recv().expect("worker key");
    owned.transfer(worker_key).expect("owner transfers");
    assert_eq!(owned.owner(), worker_key);
    value_tx.send(AssertSend::new(owned)).expect("hand off");

    assert_eq!(worker.join().expect("worker").expect("new owner unwraps"), vec![1, 2, 3]);
}
