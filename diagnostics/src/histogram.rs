//! Fixed-bucket wait-time histogram.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use tether_types::DEFAULT_WAIT_BUCKETS_US;

/// Lock-free histogram of wait durations.
///
/// `counts[i]` holds observations `<= bounds_us[i]`; the final slot collects
/// everything above the largest bound.
#[derive(Debug)]
pub struct WaitHistogram {
    bounds_us: Vec<u64>,
    counts: Vec<AtomicU64>,
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl WaitHistogram {
    /// Build a histogram from bucket bounds. Bounds are sorted and deduplicated.
    #[must_use]
    pub fn new(mut bounds_us: Vec<u64>) -> Self {
        bounds_us.sort_unstable();
        bounds_us.dedup();
        let counts = (0..=bounds_us.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds_us,
            counts,
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, waited: Duration) {
        let micros = u64::try_from(waited.as_micros()).unwrap_or(u64::MAX);
        let idx = self
            .bounds_us
            .iter()
            .position(|&bound| micros <= bound)
            .unwrap_or(self.bounds_us.len());
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(micros, Ordering::Relaxed);
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        for slot in &self.counts {
            slot.store(0, Ordering::Relaxed);
        }
        self.count.store(0, Ordering::Relaxed);
        self.sum_us.store(0, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            bounds_us: self.bounds_us.clone(),
            counts: self
                .counts
                .iter()
                .map(|slot| slot.load(Ordering::Relaxed))
                .collect(),
            count: self.count.load(Ordering::Relaxed),
            sum_us: self.sum_us.load(Ordering::Relaxed),
        }
    }
}

impl Default for WaitHistogram {
    fn default() -> Self {
        Self::new(DEFAULT_WAIT_BUCKETS_US.to_vec())
    }
}

/// Point-in-time copy of a [`WaitHistogram`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HistogramSnapshot {
    pub bounds_us: Vec<u64>,
    /// One more entry than `bounds_us`; the last is the overflow bucket.
    pub counts: Vec<u64>,
    pub count: u64,
    pub sum_us: u64,
}

impl HistogramSnapshot {
    #[must_use]
    pub fn mean(&self) -> Option<Duration> {
        (self.count > 0).then(|| Duration::from_micros(self.sum_us / self.count))
    }
}
