use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free delivery counters for a pipeline.
///
/// `snapshot()` atomically reads and resets all counters, making it
/// suitable for periodic reporting without contention.
#[derive(Debug, Default)]
pub struct PipelineStats {
    delivered: AtomicU64,
    consumed: AtomicU64,
    failed: AtomicU64,
}

/// Counter values taken by [`PipelineStats::snapshot`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Messages that left the last handler.
    pub delivered: u64,
    /// Messages a handler swallowed.
    pub consumed: u64,
    /// Messages aborted by a handler error.
    pub failed: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_consumed(&self) {
        self.consumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically read and reset all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            delivered: self.delivered.swap(0, Ordering::Relaxed),
            consumed: self.consumed.swap(0, Ordering::Relaxed),
            failed: self.failed.swap(0, Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    pub fn total(&self) -> u64 {
        self.delivered + self.consumed + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = PipelineStats::new();
        stats.record_delivered();
        stats.record_delivered();
        stats.record_failed();

        let snap = stats.snapshot();
        assert_eq!(snap.delivered, 2);
        assert_eq!(snap.consumed, 0);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.total(), 3);
    }

    #[test]
    fn test_snapshot_resets_counters() {
        let stats = PipelineStats::new();
        stats.record_consumed();

        assert_eq!(stats.snapshot().consumed, 1);
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
