//! Metric samples and the rolling window they are kept in.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Samples retained by a window unless configured otherwise.
pub const DEFAULT_WINDOW_CAPACITY: usize = 10;

/// One observation of the trigger's backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleMetricSample {
    pub unprocessed_change_count: i64,
    pub timestamp: DateTime<Utc>,
}

impl ScaleMetricSample {
    pub fn new(unprocessed_change_count: i64, timestamp: DateTime<Utc>) -> Self {
        Self {
            unprocessed_change_count,
            timestamp,
        }
    }
}

/// Source of backlog samples.
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    async fn get_metrics(&self) -> Result<ScaleMetricSample>;
}

/// Bounded, time-ordered sample history. The oldest sample is dropped on overflow.
#[derive(Debug, Clone)]
pub struct MetricsWindow {
    samples: VecDeque<ScaleMetricSample>,
    capacity: usize,
}

impl MetricsWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample. Samples older than the newest one are rejected.
    pub fn push(&mut self, sample: ScaleMetricSample) -> bool {
        if let Some(last) = self.samples.back() {
            if sample.timestamp < last.timestamp {
                tracing::debug!(
                    "Dropping out-of-order metric sample at {} (newest is {})",
                    sample.timestamp,
                    last.timestamp
                );
                return false;
            }
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        true
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<&ScaleMetricSample> {
        self.samples.back()
    }

    pub fn to_vec(&self) -> Vec<ScaleMetricSample> {
        self.samples.iter().copied().collect()
    }
}

impl Default for MetricsWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(secs: i64, count: i64) -> ScaleMetricSample {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        ScaleMetricSample::new(count, base + Duration::seconds(secs))
    }

    #[test]
    fn test_window_prunes_oldest() {
        let mut window = MetricsWindow::new(3);
        for i in 0..5 {
            assert!(window.push(at(i, i)));
        }
        let counts: Vec<i64> = window
            .to_vec()
            .iter()
            .map(|s| s.unprocessed_change_count)
            .collect();
        assert_eq!(counts, vec![2, 3, 4]);
        assert_eq!(window.latest().map(|s| s.unprocessed_change_count), Some(4));
    }

    #[test]
    fn test_window_rejects_out_of_order() {
        let mut window = MetricsWindow::default();
        assert!(window.push(at(10, 1)));
        assert!(!window.push(at(5, 2)));
        assert!(window.push(at(10, 3)));
        assert_eq!(window.len(), 2);
    }
}
