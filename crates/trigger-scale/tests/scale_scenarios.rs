//! Scale vote and target scenarios over five-sample windows.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use trigger_scale::{
    MetricsProvider, MetricsWindow, ScaleMetricSample, ScaleMonitor, ScaleStatusContext,
    ScaleVote, TargetScaler, TargetScalerContext,
};

/// Replays a fixed sequence of backlog counts, one per call, 10s apart.
struct Replay {
    counts: Vec<i64>,
    next: AtomicUsize,
}

impl Replay {
    fn new(counts: &[i64]) -> Arc<Self> {
        Arc::new(Self {
            counts: counts.to_vec(),
            next: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl MetricsProvider for Replay {
    async fn get_metrics(&self) -> Result<ScaleMetricSample> {
        let i = self.next.fetch_add(1, Ordering::SeqCst);
        let count = *self
            .counts
            .get(i)
            .ok_or_else(|| anyhow::anyhow!("replay exhausted"))?;
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Ok(ScaleMetricSample::new(
            count,
            base + Duration::seconds(i as i64 * 10),
        ))
    }
}

async fn vote_after_sampling(counts: &[i64], worker_count: u32) -> ScaleVote {
    let provider = Replay::new(counts);
    let monitor = ScaleMonitor::new("fn1", "dbo.Products", 1000, provider);
    let mut window = MetricsWindow::default();
    for _ in counts {
        window.push(monitor.get_metrics().await.unwrap());
    }
    monitor
        .get_scale_status(&ScaleStatusContext {
            worker_count,
            metrics: window.to_vec(),
        })
        .vote
}

#[tokio::test]
async fn test_spike_above_capacity_scales_out() {
    assert_eq!(vote_after_sampling(&[0, 0, 0, 0, 1001], 1).await, ScaleVote::ScaleOut);
}

#[tokio::test]
async fn test_backlog_at_capacity_holds() {
    assert_eq!(vote_after_sampling(&[0, 0, 0, 0, 1000], 1).await, ScaleVote::None);
}

#[tokio::test]
async fn test_drained_backlog_scales_in() {
    assert_eq!(vote_after_sampling(&[5, 4, 3, 2, 0], 1).await, ScaleVote::ScaleIn);
}

#[tokio::test]
async fn test_remaining_backlog_holds_last_worker() {
    assert_eq!(vote_after_sampling(&[5, 4, 3, 2, 1], 1).await, ScaleVote::None);
}

#[tokio::test]
async fn test_target_worker_counts() {
    let scaler = TargetScaler::new("fn1", "dbo.Products", 1000, Replay::new(&[6000, 4500, 100]));
    let ctx = TargetScalerContext::default();
    let mut targets = Vec::new();
    for _ in 0..3 {
        targets.push(scaler.get_scale_result(&ctx).await.unwrap().target_worker_count);
    }
    assert_eq!(targets, vec![6, 5, 1]);
}
