//! `SharedRef` / `WeakRef` across threads.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use tether_core::{Release, SharedRef};

use crate::common::{coordinator, eventually};

#[test]
fn readers_never_see_a_half_written_value() {
    const READERS: usize = 4;
    const WRITES: u64 = 200;

    let coord = coordinator();
    let pair = coord.shared((0_u64, 0_u64));
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let pair = pair.clone();
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut reads = 0_u64;
                while !stop.load(Ordering::SeqCst) {
                    let guard = pair.read();
                    assert_eq!(guard.0, guard.1, "read overlapped a write");
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    let writer = {
        let pair = pair.clone();
        thread::spawn(move || {
            for _ in 0..WRITES {
                let mut guard = pair.write();
                guard.0 += 1;
                thread::yield_now();
                guard.1 += 1;
            }
        })
    };

    writer.join().expect("writer finished despite constant reads");
    stop.store(true, Ordering::SeqCst);
    for reader in readers {
        reader.join().expect("reader");
    }

    assert_eq!(*pair.read(), (WRITES, WRITES));
    assert_eq!(pair.ref_count(), 1);
}

#[test]
fn clones_across_threads_conserve_the_count() {
    struct Tracked(Arc<AtomicUsize>);

    impl Release for Tracked {
        fn release(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let coord = coordinator();
    let released = Arc::new(AtomicUsize::new(0));
    let root = SharedRef::with_release(&coord, Tracked(Arc::clone(&released)));

    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                let clones: Vec<_> = (0..50).map(|_| root.clone()).collect();
                assert!(root.ref_count() > clones.len());
            });
        }
    });

    assert_eq!(root.ref_count(), 1);
    assert_eq!(released.load(Ordering::SeqCst), 0);
    drop(root);
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn upgrades_racing_the_last_drop_never_revive_the_value() {
    let coord = coordinator();
    let finalized = Arc::new(AtomicUsize::new(0));
    let hook = Arc::clone(&finalized);
    let strong = SharedRef::with_cleanup(&coord, 7_u32, move |_| {
        hook.fetch_add(1, Ordering::SeqCst);
    });
    let weak = strong.downgrade();

    let (start_tx, start_rx) = mpsc::channel::<()>();
    let upgrader = {
        let weak = weak.clone();
        let finalized = Arc::clone(&finalized);
        thread::spawn(move || {
            start_rx.recv().expect("start");
            let mut upgrades = 0;
            while let Some(strong) = weak.upgrade() {
                assert_eq!(finalized.load(Ordering::SeqCst), 0);
                assert_eq!(*strong.read(), 7);
                upgrades += 1;
            }
            upgrades
        })
    };

    start_tx.send(()).expect("start");
    thread::sleep(Duration::from_millis(5));
    drop(strong);

    upgrader.join().expect("upgrader");
    assert!(weak.upgrade().is_none());
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
}

#[test]
fn write_timeout_expires_under_a_held_reader() {
    let coord = coordinator();
    let shared = coord.shared(0);
    let (held_tx, held_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    let reader = {
        let shared = shared.clone();
        thread::spawn(move || {
            let _guard = shared.read();
            held_tx.send(()).expect("held");
            done_rx.recv().expect("done");
        })
    };

    held_rx.recv().expect("reader holds");
    let err = shared
        .write_timeout(Duration::from_millis(20))
        .expect_err("reader active");
    assert!(err.waited >= Duration::from_millis(20));
    // The abandoned writer must not keep new readers out.
    assert!(shared.read_timeout(Duration::from_millis(200)).is_ok());

    done_tx.send(()).expect("release reader");
    reader.join().expect("reader");
    eventually("reader gone", || shared.state().is_unborrowed());
    assert!(shared.try_write().is_ok());
}
