//! Batch dispatch: fetch rows, deliver to the executor, renew and release leases.

use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use trigger_core::{
    ChangeBatch, ChangeRow, PrimaryKey, Result, RowMapper, SqlChange, SqlChangeOperation,
    TriggerError, TriggerScope, WatchedTable,
};

use crate::executor::TriggerExecutor;
use crate::options::TriggerOptions;
use crate::store::{ReleaseOutcome, TrackingStore};

/// Summary of one delivered batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub delivered: usize,
    pub renewals: u32,
    /// `None` when release failed and the leases were left to expire.
    pub release: Option<ReleaseOutcome>,
}

pub struct BatchProcessor<T> {
    store: Arc<dyn TrackingStore>,
    scope: TriggerScope,
    table: Arc<WatchedTable>,
    options: TriggerOptions,
    executor: Arc<dyn TriggerExecutor<T>>,
}

impl<T> BatchProcessor<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn new(
        store: Arc<dyn TrackingStore>,
        scope: TriggerScope,
        table: Arc<WatchedTable>,
        options: TriggerOptions,
        executor: Arc<dyn TriggerExecutor<T>>,
    ) -> Self {
        Self {
            store,
            scope,
            table,
            options,
            executor,
        }
    }

    /// Deliver a leased batch.
    ///
    /// On executor failure the leases are not released; they expire and the
    /// changes are picked up again by a later poll.
    pub async fn process(
        &self,
        batch: ChangeBatch,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let started = Instant::now();
        let changes = self.load_changes(&batch).await?;
        let delivered = changes.len();

        let token = cancel.child_token();
        let (result, renewals) = self.dispatch(&batch, changes, &token).await;

        if let Err(e) = result {
            error!(
                "Function failed on {} change(s) from table {} (attempt {} of {}); leases left to expire: {e:#}",
                batch.len(),
                self.table.object,
                batch.max_attempt_count(),
                self.options.max_attempt_count
            );
            return Err(TriggerError::CallbackExecution(format!("{e:#}")));
        }

        let release = match self
            .store
            .release_leases(&self.scope, &self.table, &batch, &self.options)
            .await
        {
            Ok(outcome) => {
                if let Some(version) = outcome.new_sync_version {
                    debug!("Advanced sync version of table {} to {version}", self.table.object);
                }
                Some(outcome)
            }
            Err(e) => {
                warn!(
                    "Failed to release leases for table {}; they will expire: {e}",
                    self.table.object
                );
                None
            }
        };

        info!(
            "Delivered {delivered} change(s) from table {} in {} ms",
            self.table.object,
            started.elapsed().as_millis()
        );

        Ok(BatchReport {
            delivered,
            renewals,
            release,
        })
    }

    async fn load_changes(&self, batch: &ChangeBatch) -> Result<Vec<SqlChange<T>>> {
        let keys: Vec<PrimaryKey> = batch
            .iter()
            .filter(|c| c.operation != SqlChangeOperation::Delete)
            .map(|c| c.key.clone())
            .collect();

        let rows: HashMap<PrimaryKey, ChangeRow> = if keys.is_empty() {
            HashMap::new()
        } else {
            self.store
                .fetch_rows(&self.table, &keys)
                .await?
                .into_iter()
                .collect()
        };

        let mapper = RowMapper::new(&self.table);
        batch
            .iter()
            .map(|change| mapper.to_change(change, rows.get(&change.key)))
            .collect()
    }

    async fn dispatch(
        &self,
        batch: &ChangeBatch,
        mut changes: Vec<SqlChange<T>>,
        token: &CancellationToken,
    ) -> (anyhow::Result<()>, u32) {
        let chunk_size = usize::try_from(self.options.max_batch_size)
            .unwrap_or(usize::MAX)
            .max(1);
        let mut renewals = 0u32;

        let deliveries = async {
            while !changes.is_empty() {
                if token.is_cancelled() {
                    anyhow::bail!("delivery cancelled");
                }
                let rest = changes.split_off(chunk_size.min(changes.len()));
                let chunk = std::mem::replace(&mut changes, rest);
                self.executor.execute(chunk, token.clone()).await?;
            }
            Ok::<(), anyhow::Error>(())
        };

        let renewal = async {
            let interval = self.options.lease_renewal_interval();
            loop {
                tokio::time::sleep(interval).await;
                if renewals >= self.options.max_lease_renewal_count {
                    warn!(
                        "Batch from table {} exceeded {} lease renewals; cancelling the function",
                        self.table.object, self.options.max_lease_renewal_count
                    );
                    token.cancel();
                    break;
                }
                renewals += 1;
                match self
                    .store
                    .renew_leases(&self.scope, &self.table, batch, self.options.lease_duration)
                    .await
                {
                    Ok(()) => debug!(
                        "Renewed {} lease(s) for table {} ({renewals})",
                        batch.len(),
                        self.table.object
                    ),
                    Err(e) => warn!("Failed to renew leases for table {}: {e}", self.table.object),
                }
            }
            futures::future::pending::<Infallible>().await
        };

        let result = tokio::select! {
            result = deliveries => result,
            never = renewal => match never {},
        };
        (result, renewals)
    }
}
