//! Backlog metrics for the scale components, sampled from the lease store.

use async_trait::async_trait;
use std::sync::Arc;
use trigger_core::{Clock, TriggerScope, WatchedTable};
use trigger_scale::{MetricsProvider, ScaleMetricSample};

use crate::options::TriggerOptions;
use crate::store::TrackingStore;

pub struct StoreMetricsProvider {
    store: Arc<dyn TrackingStore>,
    scope: TriggerScope,
    table: Arc<WatchedTable>,
    options: TriggerOptions,
    clock: Arc<dyn Clock>,
}

impl StoreMetricsProvider {
    pub fn new(
        store: Arc<dyn TrackingStore>,
        scope: TriggerScope,
        table: Arc<WatchedTable>,
        options: TriggerOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            scope,
            table,
            options,
            clock,
        }
    }
}

#[async_trait]
impl MetricsProvider for StoreMetricsProvider {
    async fn get_metrics(&self) -> anyhow::Result<ScaleMetricSample> {
        let count = self
            .store
            .unprocessed_change_count(&self.scope, &self.table, &self.options)
            .await?;
        tracing::debug!(
            "Table {} has {count} unprocessed change(s)",
            self.table.object
        );
        Ok(ScaleMetricSample::new(count, self.clock.now()))
    }
}
