//! Shared test utilities and fixtures
//!
//! Coordinators for the common configurations, plus polling helpers for
//! cross-thread assertions where only "eventually" is guaranteed.

#![allow(dead_code)]

use std::thread;
use std::time::{Duration, Instant};

use tether_core::{Coordinator, ResolvedConfig};

/// Upper bound for anything a test waits on.
pub const PATIENCE: Duration = Duration::from_secs(5);

/// Default configuration: diagnostics off, reaping on thread exit.
pub fn coordinator() -> Coordinator {
    Coordinator::default()
}

/// Counters and deadlock detection on.
pub fn instrumented() -> Coordinator {
    let mut config = ResolvedConfig::default();
    config.diagnostics.enabled = true;
    config.diagnostics.deadlock_detection = true;
    Coordinator::new(config)
}

/// Counters on, and contexts of exited threads kept until `reap_exited`.
pub fn without_reaping() -> Coordinator {
    let mut config = ResolvedConfig::default();
    config.diagnostics.enabled = true;
    config.reap_on_thread_exit = false;
    Coordinator::new(config)
}

/// Poll `condition` until it holds; panic after [`PATIENCE`].
pub fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + PATIENCE;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Assert `condition` stays false for `window`.
pub fn never_within(window: Duration, what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + window;
    while Instant::now() < deadline {
        assert!(!condition(), "{what}");
        thread::sleep(Duration::from_millis(1));
    }
}
