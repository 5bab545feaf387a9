//! # Telemetry History
//!
//! Bounded time-series storage for charting.
//!
//! Two independent caps apply simultaneously: a maximum age relative to the
//! newest point (the playback window) and a maximum point count. Eviction
//! removes aged-out points first, then trims from the oldest remaining while
//! the count cap is still exceeded. This bounds memory under sustained
//! operation regardless of update rate.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// One timestamped sample. Never mutated after insertion.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPoint<T> {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub value: T,
}

/// Dual-capped series of one signal class
#[derive(Debug)]
pub struct SeriesHistory<T> {
    points: VecDeque<HistoryPoint<T>>,
    window: chrono::Duration,
    max_points: usize,
}

impl<T: Clone> SeriesHistory<T> {
    pub fn new(window: Duration, max_points: usize) -> Self {
        Self {
            points: VecDeque::new(),
            window: chrono::Duration::from_std(window)
                .unwrap_or_else(|_| chrono::Duration::seconds(300)),
            max_points,
        }
    }

    /// Append a sample and apply both caps.
    ///
    /// Points are expected in arrival order; the age cutoff is measured
    /// against the newest point, not the wall clock, so a stalled link does
    /// not silently drain its own history.
    pub fn push(&mut self, at: DateTime<Utc>, value: T) {
        self.points.push_back(HistoryPoint { at, value });

        let cutoff = at - self.window;
        while let Some(front) = self.points.front() {
            if front.at < cutoff {
                self.points.pop_front();
            } else {
                break;
            }
        }
        while self.points.len() > self.max_points {
            self.points.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn newest(&self) -> Option<&HistoryPoint<T>> {
        self.points.back()
    }

    pub fn oldest(&self) -> Option<&HistoryPoint<T>> {
        self.points.front()
    }

    /// Points within `window` of the newest sample, oldest first
    pub fn within(&self, window: Duration) -> Vec<HistoryPoint<T>> {
        let Some(newest) = self.points.back() else {
            return Vec::new();
        };
        let span = chrono::Duration::from_std(window).unwrap_or(self.window);
        let cutoff = newest.at - span;
        self.points
            .iter()
            .filter(|point| point.at >= cutoff)
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_push_and_order() {
        let mut series = SeriesHistory::new(Duration::from_secs(300), 100);
        let t0 = base_time();
        for i in 0..5 {
            series.push(t0 + chrono::Duration::seconds(i), i);
        }
        assert_eq!(series.len(), 5);
        assert_eq!(series.oldest().unwrap().value, 0);
        assert_eq!(series.newest().unwrap().value, 4);
    }

    #[test]
    fn test_age_eviction() {
        let mut series = SeriesHistory::new(Duration::from_secs(300), 100_000);
        let t0 = base_time();
        // 600s of points at 1Hz: only the last 300s survive
        for i in 0..600 {
            series.push(t0 + chrono::Duration::seconds(i), i);
        }
        assert_eq!(series.len(), 301);
        assert_eq!(series.oldest().unwrap().value, 299);
    }

    #[test]
    fn test_count_cap_applies_after_age() {
        let mut series = SeriesHistory::new(Duration::from_secs(300), 50);
        let t0 = base_time();
        for i in 0..600 {
            series.push(t0 + chrono::Duration::seconds(i), i);
        }
        // Age would leave 301, the count cap trims to 50
        assert_eq!(series.len(), 50);
        assert_eq!(series.oldest().unwrap().value, 550);
        assert_eq!(series.newest().unwrap().value, 599);
    }

    #[test]
    fn test_burst_within_window_hits_count_cap_exactly() {
        // 6000 rapid-fire points inside the window: the count cap is the
        // binding limit and the retained span stays inside the window
        let mut series = SeriesHistory::new(Duration::from_secs(300), 5000);
        let t0 = base_time();
        for i in 0..6000u32 {
            series.push(t0 + chrono::Duration::milliseconds(i as i64 * 10), i);
        }
        assert_eq!(series.len(), 5000);
        let newest = series.newest().unwrap().at;
        let oldest = series.oldest().unwrap().at;
        assert!(newest - oldest <= chrono::Duration::seconds(300));
    }

    #[test]
    fn test_within_filters_by_requested_window() {
        let mut series = SeriesHistory::new(Duration::from_secs(300), 1000);
        let t0 = base_time();
        for i in 0..200 {
            series.push(t0 + chrono::Duration::seconds(i), i);
        }
        let recent = series.within(Duration::from_secs(30));
        assert_eq!(recent.len(), 31);
        assert_eq!(recent.first().unwrap().value, 169);
        assert_eq!(recent.last().unwrap().value, 199);
    }

    #[test]
    fn test_within_on_empty_series() {
        let series: SeriesHistory<u32> = SeriesHistory::new(Duration::from_secs(300), 10);
        assert!(series.within(Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_clear() {
        let mut series = SeriesHistory::new(Duration::from_secs(300), 10);
        series.push(base_time(), 1);
        assert!(!series.is_empty());
        series.clear();
        assert!(series.is_empty());
    }
}
