//! Scale votes from a window of backlog samples.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::metrics::{MetricsProvider, ScaleMetricSample};

/// Fewer samples than this yields no vote. Only the last this-many are used.
pub const MIN_SAMPLES_FOR_SCALING: usize = 5;

/// Look-back used to project an increasing backlog forward.
pub const TREND_REFERENCE_WINDOW_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleVote {
    None,
    ScaleOut,
    ScaleIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleStatus {
    pub vote: ScaleVote,
}

impl ScaleStatus {
    fn vote(vote: ScaleVote) -> Self {
        Self { vote }
    }
}

/// Current worker count plus the samples gathered so far, oldest first.
#[derive(Debug, Clone, Default)]
pub struct ScaleStatusContext {
    pub worker_count: u32,
    pub metrics: Vec<ScaleMetricSample>,
}

pub struct ScaleMonitor {
    descriptor: String,
    table_name: String,
    max_changes_per_worker: u32,
    provider: Arc<dyn MetricsProvider>,
}

impl ScaleMonitor {
    pub fn new(
        user_function_id: &str,
        table_name: &str,
        max_changes_per_worker: u32,
        provider: Arc<dyn MetricsProvider>,
    ) -> Self {
        Self {
            descriptor: crate::scaler_descriptor(user_function_id, table_name),
            table_name: table_name.to_string(),
            max_changes_per_worker,
            provider,
        }
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub async fn get_metrics(&self) -> Result<ScaleMetricSample> {
        self.provider.get_metrics().await
    }

    /// Vote on scaling. Computation failures are logged and yield `None`.
    pub fn get_scale_status(&self, context: &ScaleStatusContext) -> ScaleStatus {
        match self.compute_vote(context.worker_count, &context.metrics) {
            Ok(vote) => ScaleStatus::vote(vote),
            Err(e) => {
                warn!(
                    "Failed to compute scale status for table '{}': {e:#}",
                    self.table_name
                );
                ScaleStatus::vote(ScaleVote::None)
            }
        }
    }

    fn compute_vote(&self, worker_count: u32, metrics: &[ScaleMetricSample]) -> Result<ScaleVote> {
        if metrics.len() < MIN_SAMPLES_FOR_SCALING {
            debug!(
                "Requesting no-scaling: insufficient metrics for table '{}' ({} of {})",
                self.table_name,
                metrics.len(),
                MIN_SAMPLES_FOR_SCALING
            );
            return Ok(ScaleVote::None);
        }

        let metrics = &metrics[metrics.len() - MIN_SAMPLES_FOR_SCALING..];
        let latest = metrics[metrics.len() - 1];
        let counts: Vec<i64> = metrics.iter().map(|m| m.unprocessed_change_count).collect();
        debug!(
            "Unprocessed change counts for table '{}': {counts:?}, worker count {worker_count}",
            self.table_name
        );

        let per_worker = i64::from(self.max_changes_per_worker);
        let capacity = i64::from(worker_count)
            .checked_mul(per_worker)
            .ok_or_else(|| anyhow::anyhow!("worker capacity overflows"))?;

        if latest.unprocessed_change_count > capacity {
            info!(
                "Requesting scale-out: table '{}' has {} unprocessed changes for {worker_count} worker(s)",
                self.table_name, latest.unprocessed_change_count
            );
            return Ok(ScaleVote::ScaleOut);
        }

        let increasing = metrics
            .windows(2)
            .all(|w| w[0].unprocessed_change_count < w[1].unprocessed_change_count);
        if increasing {
            let reference_time =
                latest.timestamp - chrono::Duration::seconds(TREND_REFERENCE_WINDOW_SECS);
            let reference = metrics
                .iter()
                .find(|m| m.timestamp > reference_time)
                .unwrap_or(&latest);
            let projected = latest
                .unprocessed_change_count
                .checked_mul(2)
                .and_then(|v| v.checked_sub(reference.unprocessed_change_count))
                .ok_or_else(|| anyhow::anyhow!("projected change count overflows"))?;
            if projected > capacity {
                info!(
                    "Requesting scale-out: table '{}' is projected to reach {projected} unprocessed changes",
                    self.table_name
                );
                return Ok(ScaleVote::ScaleOut);
            }
        }

        let decreasing = metrics.windows(2).all(|w| {
            w[0].unprocessed_change_count > w[1].unprocessed_change_count
                || w[1].unprocessed_change_count == 0
        });
        if decreasing {
            // Negative with no workers, so an idle table never votes to shed one.
            let remaining_workers = i64::from(worker_count) - 1;
            let reduced_capacity = remaining_workers
                .checked_mul(per_worker)
                .ok_or_else(|| anyhow::anyhow!("worker capacity overflows"))?;
            if latest.unprocessed_change_count <= reduced_capacity {
                info!(
                    "Requesting scale-in: table '{}' backlog of {} fits in {remaining_workers} worker(s)",
                    self.table_name, latest.unprocessed_change_count
                );
                return Ok(ScaleVote::ScaleIn);
            }
        }

        debug!("Requesting no-scaling for table '{}'", self.table_name);
        Ok(ScaleVote::None)
    }
}
