// Monotone run counters shared by producers, demultiplexers, and the
// once-per-second reporter.
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counters {
    points_sent: AtomicU64,
    points_received: AtomicU64,
    points_verified: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub points_sent: u64,
    pub points_received: u64,
    pub points_verified: u64,
}

impl Counters {
    pub fn add_sent(&self, count: u64) {
        self.points_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_received(&self, count: u64) {
        self.points_received.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_verified(&self, count: u64) {
        self.points_verified.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            points_sent: self.points_sent.load(Ordering::Relaxed),
            points_received: self.points_received.load(Ordering::Relaxed),
            points_verified: self.points_verified.load(Ordering::Relaxed),
        }
    }
}

impl CountersSnapshot {
    /// Progress made since an earlier snapshot. The counters are monotone,
    /// so the reporter diffs snapshots instead of resetting shared state.
    pub fn since(&self, earlier: &CountersSnapshot) -> CountersSnapshot {
        CountersSnapshot {
            points_sent: self.points_sent - earlier.points_sent,
            points_received: self.points_received - earlier.points_received,
            points_verified: self.points_verified - earlier.points_verified,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let counters = Counters::default();
        counters.add_sent(4);
        counters.add_sent(2);
        counters.add_received(4);
        counters.add_verified(1);
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.points_sent, 6);
        assert_eq!(snapshot.points_received, 4);
        assert_eq!(snapshot.points_verified, 1);
    }

    #[test]
    fn snapshot_diff_reports_interval_progress() {
        let counters = Counters::default();
        counters.add_sent(10);
        let first = counters.snapshot();
        counters.add_sent(5);
        counters.add_received(12);
        let second = counters.snapshot();
        let delta = second.since(&first);
        assert_eq!(delta.points_sent, 5);
        assert_eq!(delta.points_received, 12);
    }
}
