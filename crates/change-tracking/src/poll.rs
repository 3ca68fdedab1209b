//! The change poll loop.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trigger_core::{Result, TriggerScope, WatchedTable};

use crate::options::TriggerOptions;
use crate::processor::BatchProcessor;
use crate::store::{LeaseAcquisition, TrackingStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollState {
    NotStarted,
    Polling,
    /// Cancellation observed; waiting for the in-flight tick to finish.
    Draining,
    Stopped,
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The application lock was held elsewhere.
    Skipped,
    /// Nothing new to lease.
    Idle,
    Delivered(usize),
}

/// Repeatedly leases changes of one scope and hands them to the processor.
pub struct ChangePoller<T> {
    store: Arc<dyn TrackingStore>,
    scope: TriggerScope,
    table: Arc<WatchedTable>,
    options: TriggerOptions,
    processor: BatchProcessor<T>,
    state: watch::Sender<PollState>,
}

impl<T> ChangePoller<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn new(
        store: Arc<dyn TrackingStore>,
        scope: TriggerScope,
        table: Arc<WatchedTable>,
        options: TriggerOptions,
        processor: BatchProcessor<T>,
    ) -> Self {
        let (state, _) = watch::channel(PollState::NotStarted);
        Self {
            store,
            scope,
            table,
            options,
            processor,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PollState> {
        self.state.subscribe()
    }

    /// Poll until `cancel` fires. Tick failures are logged and polling continues.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "Starting change polling for table {} every {} ms",
            self.table.object,
            self.options.polling_interval.as_millis()
        );
        self.state.send_replace(PollState::Polling);

        while !cancel.is_cancelled() {
            let tick = self.tick(&cancel);
            tokio::pin!(tick);

            let result = tokio::select! {
                biased;
                result = &mut tick => result,
                _ = cancel.cancelled() => {
                    self.state.send_replace(PollState::Draining);
                    debug!("Draining in-flight tick for table {}", self.table.object);
                    tick.await
                }
            };
            if let Err(e) = result {
                warn!("Poll tick for table {} failed: {e}", self.table.object);
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.options.polling_interval) => {}
            }
        }

        self.state.send_replace(PollState::Stopped);
        info!("Stopped change polling for table {}", self.table.object);
    }

    /// Run one lock, lease and dispatch cycle.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<TickOutcome> {
        let acquisition = self
            .store
            .acquire_changes(&self.scope, &self.table, &self.options)
            .await?;

        let batch = match acquisition {
            LeaseAcquisition::Busy => {
                debug!(
                    "Application lock for table {} is held by another worker; skipping tick",
                    self.table.object
                );
                return Ok(TickOutcome::Skipped);
            }
            LeaseAcquisition::Acquired(batch) if batch.is_empty() => {
                debug!("No new changes for table {}", self.table.object);
                return Ok(TickOutcome::Idle);
            }
            LeaseAcquisition::Acquired(batch) => batch,
        };

        debug!(
            "Leased {} change(s) for table {} up to version {:?}",
            batch.len(),
            self.table.object,
            batch.max_version()
        );
        let report = self.processor.process(batch, cancel).await?;
        Ok(TickOutcome::Delivered(report.delivered))
    }
}
