//! Lock-free latency accumulation for periodic sampling work

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Running latency totals.
///
/// Recording and reading are plain atomic operations, so a sampler never waits
/// on a reader. A mean read while a sample is being recorded may be off by
/// that one sample.
#[derive(Debug, Default)]
pub struct LatencyCounter {
    total_nanos: AtomicU64,
    count: AtomicU64,
    worst_nanos: AtomicU64,
}

impl LatencyCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.worst_nanos.fetch_max(nanos, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Release);
    }

    pub fn mean(&self) -> Duration {
        let count = self.count.load(Ordering::Acquire);
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.total_nanos.load(Ordering::Relaxed) / count)
    }

    pub fn worst(&self) -> Duration {
        Duration::from_nanos(self.worst_nanos.load(Ordering::Relaxed))
    }

    pub fn samples(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }
}
