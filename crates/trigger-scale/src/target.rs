//! Target-based scaling: desired worker count from the current backlog.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::metrics::MetricsProvider;

#[derive(Debug, Error)]
pub enum ScaleError {
    #[error("Instance concurrency must be at least 1, got {0}")]
    InvalidConcurrency(u32),

    #[error("Failed to sample metrics: {0:#}")]
    Metrics(#[from] anyhow::Error),
}

/// Host-provided hints for target computation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TargetScalerContext {
    /// Changes one instance handles concurrently; falls back to max changes per worker.
    pub instance_concurrency: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetScalerResult {
    pub target_worker_count: u32,
}

pub struct TargetScaler {
    descriptor: String,
    max_changes_per_worker: u32,
    provider: Arc<dyn MetricsProvider>,
}

impl TargetScaler {
    pub fn new(
        user_function_id: &str,
        table_name: &str,
        max_changes_per_worker: u32,
        provider: Arc<dyn MetricsProvider>,
    ) -> Self {
        Self {
            descriptor: crate::scaler_descriptor(user_function_id, table_name),
            max_changes_per_worker,
            provider,
        }
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Sample the backlog and compute the target worker count.
    pub async fn get_scale_result(
        &self,
        context: &TargetScalerContext,
    ) -> Result<TargetScalerResult, ScaleError> {
        let sample = self.provider.get_metrics().await?;
        let target_worker_count =
            self.get_target_worker_count(context, sample.unprocessed_change_count)?;
        Ok(TargetScalerResult {
            target_worker_count,
        })
    }

    /// `max(1, ceil(unprocessed / concurrency))`.
    pub fn get_target_worker_count(
        &self,
        context: &TargetScalerContext,
        unprocessed_change_count: i64,
    ) -> Result<u32, ScaleError> {
        let concurrency = context
            .instance_concurrency
            .unwrap_or(self.max_changes_per_worker);
        if concurrency < 1 {
            return Err(ScaleError::InvalidConcurrency(concurrency));
        }

        let unprocessed = u64::try_from(unprocessed_change_count).unwrap_or(0);
        let target = unprocessed.div_ceil(u64::from(concurrency)).max(1);
        let target = u32::try_from(target).unwrap_or(u32::MAX);
        debug!(
            "Target worker count for '{}': {target} ({unprocessed_change_count} unprocessed, concurrency {concurrency})",
            self.descriptor
        );
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ScaleMetricSample;
    use async_trait::async_trait;
    use chrono::Utc;

    struct Fixed(i64);

    #[async_trait]
    impl MetricsProvider for Fixed {
        async fn get_metrics(&self) -> anyhow::Result<ScaleMetricSample> {
            Ok(ScaleMetricSample::new(self.0, Utc::now()))
        }
    }

    fn scaler(backlog: i64) -> TargetScaler {
        TargetScaler::new("fn1", "dbo.Products", 1000, Arc::new(Fixed(backlog)))
    }

    #[test]
    fn test_target_rounds_up() {
        let ctx = TargetScalerContext::default();
        assert_eq!(scaler(0).get_target_worker_count(&ctx, 6000).unwrap(), 6);
        assert_eq!(scaler(0).get_target_worker_count(&ctx, 4500).unwrap(), 5);
        assert_eq!(scaler(0).get_target_worker_count(&ctx, 100).unwrap(), 1);
    }

    #[test]
    fn test_target_never_below_one() {
        let ctx = TargetScalerContext::default();
        assert_eq!(scaler(0).get_target_worker_count(&ctx, 0).unwrap(), 1);
        assert_eq!(scaler(0).get_target_worker_count(&ctx, -5).unwrap(), 1);
    }

    #[test]
    fn test_instance_concurrency_overrides() {
        let ctx = TargetScalerContext {
            instance_concurrency: Some(250),
        };
        assert_eq!(scaler(0).get_target_worker_count(&ctx, 1000).unwrap(), 4);
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let ctx = TargetScalerContext {
            instance_concurrency: Some(0),
        };
        assert!(matches!(
            scaler(0).get_target_worker_count(&ctx, 10),
            Err(ScaleError::InvalidConcurrency(0))
        ));
    }

    #[tokio::test]
    async fn test_scale_result_samples_provider() {
        let result = scaler(2500)
            .get_scale_result(&TargetScalerContext::default())
            .await
            .unwrap();
        assert_eq!(result.target_worker_count, 3);
    }
}
