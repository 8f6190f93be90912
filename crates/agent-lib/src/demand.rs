//! Windowed demand estimation
//!
//! Converts instantaneous load samples into averages over the configured
//! short and long estimation windows. The tracker is generic over the load
//! key so the same implementation serves per-container compute demand and
//! node-level network demand.

use crate::models::EstimationWindow;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::Duration;

/// Timestamped history of keyed load values with bounded retention.
///
/// History never retains an entry older than the larger of the two
/// configured windows, measured from the most recent update.
#[derive(Debug)]
pub struct DemandTracker<K> {
    history: BTreeMap<i64, HashMap<K, f64>>,
    short_window: Duration,
    long_window: Duration,
}

impl<K: Eq + Hash + Clone> DemandTracker<K> {
    pub fn new(short_window: Duration, long_window: Duration) -> Self {
        Self {
            history: BTreeMap::new(),
            short_window,
            long_window,
        }
    }

    fn window_duration(&self, window: EstimationWindow) -> Duration {
        match window {
            EstimationWindow::Short => self.short_window,
            EstimationWindow::Long => self.long_window,
        }
    }

    /// Record the load observed at `timestamp_ms`, then prune entries older
    /// than `timestamp_ms - max(short, long)`.
    pub fn update(&mut self, timestamp_ms: i64, load: HashMap<K, f64>) {
        self.history.insert(timestamp_ms, load);

        let retention = self.short_window.max(self.long_window);
        let cutoff = timestamp_ms - retention.as_millis() as i64;
        self.history = self.history.split_off(&cutoff);
    }

    /// Per-key arithmetic mean over all samples with
    /// `timestamp >= now - window`. Keys with no samples in the window are
    /// absent from the result.
    pub fn average(&self, now: i64, window: EstimationWindow) -> HashMap<K, f64> {
        let cutoff = now - self.window_duration(window).as_millis() as i64;

        let mut sums: HashMap<K, f64> = HashMap::new();
        let mut counts: HashMap<K, u64> = HashMap::new();

        for (_, load) in self.history.range(cutoff..) {
            for (key, value) in load {
                *sums.entry(key.clone()).or_insert(0.0) += value;
                *counts.entry(key.clone()).or_insert(0) += 1;
            }
        }

        sums.into_iter()
            .map(|(key, sum)| {
                let count = counts[&key];
                (key, sum / count as f64)
            })
            .collect()
    }

    /// Number of retained history entries.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// The oldest retained timestamp, if any.
    pub fn oldest_timestamp(&self) -> Option<i64> {
        self.history.keys().next().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(entries: &[(&str, f64)]) -> HashMap<String, f64> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn test_average_over_window() {
        let mut tracker = DemandTracker::new(Duration::from_secs(10), Duration::from_secs(60));

        tracker.update(1_000, load(&[("a", 2.0)]));
        tracker.update(2_000, load(&[("a", 4.0)]));
        tracker.update(3_000, load(&[("a", 6.0)]));

        let avg = tracker.average(3_000, EstimationWindow::Short);
        assert!((avg["a"] - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_samples_outside_window_excluded() {
        let mut tracker = DemandTracker::new(Duration::from_secs(5), Duration::from_secs(60));

        tracker.update(1_000, load(&[("a", 100.0)]));
        tracker.update(20_000, load(&[("a", 2.0)]));
        tracker.update(21_000, load(&[("a", 4.0)]));

        // the 1s sample is still in history (long window) but outside the
        // short window
        let avg = tracker.average(21_000, EstimationWindow::Short);
        assert!((avg["a"] - 3.0).abs() < f64::EPSILON);

        let avg_long = tracker.average(21_000, EstimationWindow::Long);
        assert!((avg_long["a"] - (106.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn test_history_pruned_to_larger_window() {
        let mut tracker = DemandTracker::new(Duration::from_secs(5), Duration::from_secs(30));

        tracker.update(1_000, load(&[("a", 1.0)]));
        tracker.update(40_000, load(&[("a", 1.0)]));

        // 1s entry is older than 40s - 30s
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.oldest_timestamp(), Some(40_000));
    }

    #[test]
    fn test_key_absent_when_no_samples_in_window() {
        let mut tracker = DemandTracker::new(Duration::from_secs(5), Duration::from_secs(60));

        tracker.update(1_000, load(&[("old", 1.0)]));
        tracker.update(30_000, load(&[("new", 2.0)]));

        let avg = tracker.average(30_000, EstimationWindow::Short);
        assert!(!avg.contains_key("old"));
        assert!((avg["new"] - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_boundary_sample_included() {
        let mut tracker = DemandTracker::new(Duration::from_secs(10), Duration::from_secs(10));

        tracker.update(10_000, load(&[("a", 8.0)]));
        tracker.update(20_000, load(&[("a", 2.0)]));

        // sample exactly at now - window counts
        let avg = tracker.average(20_000, EstimationWindow::Short);
        assert!((avg["a"] - 5.0).abs() < f64::EPSILON);
    }
}
