//! Coarse per-session timing statistics, reported at teardown.

use std::sync::OnceLock;
use std::time::Instant;

/// Monotonic microseconds since the first call in this process.
pub fn micros_now() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}

#[derive(Debug, Clone, Copy)]
pub struct TimingStats {
    min: u64,
    max: u64,
    sum: u64,
    count: u64,
}

impl Default for TimingStats {
    fn default() -> Self {
        Self {
            min: u64::MAX,
            max: 0,
            sum: 0,
            count: 0,
        }
    }
}

impl TimingStats {
    pub fn record(&mut self, value: u64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
        self.count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn log(&self, name: &str) {
        if self.count == 0 {
            return;
        }
        tracing::debug!(
            "{} min/avg/max: {}/{}/{}us over {} frames",
            name,
            self.min,
            self.sum / self.count,
            self.max,
            self.count
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_micros_monotonic() {
        let a = micros_now();
        let b = micros_now();
        assert!(b >= a);
    }

    #[test]
    fn test_stats_track_extremes() {
        let mut stats = TimingStats::default();
        for value in [30, 10, 20] {
            stats.record(value);
        }
        assert_eq!(stats.min, 10);
        assert_eq!(stats.max, 30);
        assert_eq!(stats.sum / stats.count, 20);
        assert_eq!(stats.count(), 3);
    }
}
