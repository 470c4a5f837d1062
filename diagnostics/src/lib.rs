//! Optional instrumentation for Tether locks.
//!
//! Everything here is advisory: turning diagnostics on or off never changes which
//! borrows are granted, only what is counted and reported.
//!
//! - **Counters**: borrows by kind, contention events, failed `try_*` attempts,
//!   timeouts, borrows still held at thread exit, forced releases.
//! - **Wait-time histogram**: how long contended requests waited.
//! - **Deadlock heuristic** (elevated mode): a wait-for graph checked for cycles
//!   every time a thread starts waiting.
//!
//! All recording methods are cheap no-ops while their mode is disabled.

mod histogram;
mod wait_graph;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use tether_types::{BorrowKind, DEFAULT_WAIT_BUCKETS_US, DeadlockReport, LockId, ThreadKey};

pub use histogram::{HistogramSnapshot, WaitHistogram};
pub use wait_graph::WaitForGraph;

/// Callback invoked with every deadlock report.
pub type DeadlockObserver = Arc<dyn Fn(&DeadlockReport) + Send + Sync>;

/// Construction-time settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticsSettings {
    pub enabled: bool,
    pub deadlock_detection: bool,
    pub histogram_buckets_us: Vec<u64>,
    /// Most recent reports retained; older ones are dropped.
    pub max_deadlock_reports: usize,
}

impl Default for DiagnosticsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            deadlock_detection: false,
            histogram_buckets_us: DEFAULT_WAIT_BUCKETS_US.to_vec(),
            max_deadlock_reports: 64,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    borrows_total: AtomicU64,
    shared_borrows: AtomicU64,
    exclusive_borrows: AtomicU64,
    contentions: AtomicU64,
    try_failures: AtomicU64,
    timeouts: AtomicU64,
    held_at_exit: AtomicU64,
    forced_releases: AtomicU64,
    deadlocks_detected: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        for counter in [
            &self.borrows_total,
            &self.shared_borrows,
            &self.exclusive_borrows,
            &self.contentions,
            &self.try_failures,
            &self.timeouts,
            &self.held_at_exit,
            &self.forced_releases,
            &self.deadlocks_detected,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared instrumentation sink. One instance per coordinator.
pub struct Diagnostics {
    enabled: AtomicBool,
    deadlock_detection: AtomicBool,
    counters: Counters,
    wait_times: WaitHistogram,
    graph: Mutex<WaitForGraph>,
    reports: Mutex<VecDeque<DeadlockReport>>,
    max_reports: usize,
    observer: RwLock<Option<DeadlockObserver>>,
}

impl Diagnostics {
    #[must_use]
    pub fn new(settings: DiagnosticsSettings) -> Self {
        Self {
            enabled: AtomicBool::new(settings.enabled),
            deadlock_detection: AtomicBool::new(settings.deadlock_detection),
            counters: Counters::default(),
            wait_times: WaitHistogram::new(settings.histogram_buckets_us),
            graph: Mutex::new(WaitForGraph::new()),
            reports: Mutex::new(VecDeque::new()),
            max_reports: settings.max_deadlock_reports,
            observer: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn deadlock_detection(&self) -> bool {
        self.deadlock_detection.load(Ordering::Relaxed)
    }

    /// Toggle the wait-for graph. Switching it off discards the graph, since
    /// edges recorded before a gap in tracking would be stale.
    pub fn set_deadlock_detection(&self, on: bool) {
        let was = self.deadlock_detection.swap(on, Ordering::Relaxed);
        if was && !on {
            lock(&self.graph).clear();
        }
    }

    /// Install a callback that receives every deadlock report.
    pub fn set_deadlock_observer(&self, observer: Option<DeadlockObserver>) {
        *self
            .observer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = observer;
    }

    /// A borrow was granted. `waited` is `Some` when the request had to wait.
    pub fn record_grant(
        &self,
        thread: ThreadKey,
        lock_id: LockId,
        kind: BorrowKind,
        waited: Option<Duration>,
    ) {
        if self.is_enabled() {
            bump(&self.counters.borrows_total);
            match kind {
                BorrowKind::Shared => bump(&self.counters.shared_borrows),
                BorrowKind::Exclusive => bump(&self.counters.exclusive_borrows),
            }
            if let Some(waited) = waited {
                bump(&self.counters.contentions);
                self.wait_times.observe(waited);
            }
        }
        if self.deadlock_detection() {
            lock(&self.graph).acquire(thread, lock_id);
        }
    }

    /// A borrow was returned, normally or by force.
    pub fn record_release(&self, thread: ThreadKey, lock_id: LockId) {
        if self.deadlock_detection() {
            lock(&self.graph).release(thread, lock_id);
        }
    }

    /// `thread` is about to block on `lock_id`.
    ///
    /// Returns the deadlock report if the wait closes a cycle. The report has
    /// already been logged, retained and passed to the observer.
    pub fn record_wait_start(
        &self,
        thread: ThreadKey,
        lock_id: LockId,
        kind: BorrowKind,
    ) -> Option<DeadlockReport> {
        if !self.deadlock_detection() {
            return None;
        }
        let report = lock(&self.graph).begin_wait(thread, lock_id)?;
        warn!(
            %thread,
            lock = %lock_id,
            requested = %kind,
            "{report}"
        );
        self.publish(&report);
        Some(report)
    }

    /// A bounded wait expired without a grant. It still counts as contention.
    pub fn record_wait_abandoned(&self, thread: ThreadKey, waited: Duration) {
        if self.is_enabled() {
            bump(&self.counters.contentions);
            bump(&self.counters.timeouts);
            self.wait_times.observe(waited);
        }
        if self.deadlock_detection() {
            lock(&self.graph).end_wait(thread);
        }
    }

    /// A non-blocking request was refused.
    pub fn record_try_failure(&self) {
        if self.is_enabled() {
            bump(&self.counters.try_failures);
        }
    }

    /// A thread exited while `count` of its borrows were still recorded.
    pub fn record_held_at_exit(&self, count: usize) {
        if self.is_enabled() {
            let count = u64::try_from(count).unwrap_or(u64::MAX);
            self.counters.held_at_exit.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// A borrow recorded for an exited thread was released without its handle.
    pub fn record_forced_release(&self, thread: ThreadKey, lock_id: LockId) {
        if self.is_enabled() {
            bump(&self.counters.forced_releases);
        }
        self.record_release(thread, lock_id);
    }

    /// `thread` is gone; drop whatever the graph still says about it.
    pub fn forget_thread(&self, thread: ThreadKey) {
        if self.deadlock_detection() {
            lock(&self.graph).forget_thread(thread);
        }
    }

    fn publish(&self, report: &DeadlockReport) {
        bump(&self.counters.deadlocks_detected);
        if self.max_reports > 0 {
            let mut reports = lock(&self.reports);
            while reports.len() >= self.max_reports {
                reports.pop_front();
            }
            reports.push_back(report.clone());
        }
        let observer = self
            .observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(observer) = observer {
            observer(report);
        }
    }

    /// Retained deadlock reports, oldest first.
    #[must_use]
    pub fn deadlock_reports(&self) -> Vec<DeadlockReport> {
        lock(&self.reports).iter().cloned().collect()
    }

    #[must_use]
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let c = &self.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        DiagnosticsSnapshot {
            enabled: self.is_enabled(),
            deadlock_detection: self.deadlock_detection(),
            borrows_total: load(&c.borrows_total),
            shared_borrows: load(&c.shared_borrows),
            exclusive_borrows: load(&c.exclusive_borrows),
            contentions: load(&c.contentions),
            try_failures: load(&c.try_failures),
            timeouts: load(&c.timeouts),
            held_at_exit: load(&c.held_at_exit),
            forced_releases: load(&c.forced_releases),
            deadlocks_detected: load(&c.deadlocks_detected),
            wait_time: self.wait_times.snapshot(),
            recent_deadlocks: self.deadlock_reports(),
        }
    }

    /// Zero all counters and drop retained reports. The wait-for graph is kept,
    /// since it mirrors borrows that are still live.
    pub fn reset(&self) {
        self.counters.reset();
        self.wait_times.reset();
        lock(&self.reports).clear();
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(DiagnosticsSettings::default())
    }
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostics")
            .field("enabled", &self.is_enabled())
            .field("deadlock_detection", &self.deadlock_detection())
            .field("max_reports", &self.max_reports)
            .finish_non_exhaustive()
    }
}

/// Serializable view of a [`Diagnostics`] instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub enabled: bool,
    pub deadlock_detection: bool,
    pub borrows_total: u64,
    pub shared_borrows: u64,
    pub exclusive_borrows: u64,
    pub contentions: u64,
    pub try_failures: u64,
    pub timeouts: u64,
    /// Borrows still recorded when their thread exited.
    pub held_at_exit: u64,
    pub forced_releases: u64,
    pub deadlocks_detected: u64,
    pub wait_time: HistogramSnapshot,
    pub recent_deadlocks: Vec<DeadlockReport>,
}
