//! Trigger listener lifecycle.
//!
//! ```text
//! Created ──start──▶ Starting ──▶ Running ──stop──▶ Stopping ──▶ Stopped
//!    ▲                  │
//!    └──── start-up ────┘
//!          failure
//! ```

use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use trigger_core::{
    Clock, ConfigurationError, Result, SqlObject, SystemClock, TriggerError, TriggerScope,
    WatchedTable,
};
use trigger_scale::{ScaleMonitor, TargetScaler};

use crate::cache::TableInfoCache;
use crate::executor::TriggerExecutor;
use crate::metrics::StoreMetricsProvider;
use crate::options::TriggerOptions;
use crate::poll::{ChangePoller, PollState};
use crate::processor::BatchProcessor;
use crate::store::TrackingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

struct RunningTrigger {
    scope: TriggerScope,
    table: Arc<WatchedTable>,
    poll_state: watch::Receiver<PollState>,
}

/// Builder for [`TriggerListener`].
pub struct TriggerListenerBuilder<T> {
    connection_string: Option<String>,
    table_name: Option<String>,
    user_function_id: Option<String>,
    executor: Option<Arc<dyn TriggerExecutor<T>>>,
    store: Option<Arc<dyn TrackingStore>>,
    options: TriggerOptions,
    cache: Option<Arc<TableInfoCache>>,
    clock: Option<Arc<dyn Clock>>,
}

impl<T> Default for TriggerListenerBuilder<T> {
    fn default() -> Self {
        Self {
            connection_string: None,
            table_name: None,
            user_function_id: None,
            executor: None,
            store: None,
            options: TriggerOptions::default(),
            cache: None,
            clock: None,
        }
    }
}

impl<T> TriggerListenerBuilder<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = Some(connection_string.into());
        self
    }

    pub fn table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }

    pub fn user_function_id(mut self, user_function_id: impl Into<String>) -> Self {
        self.user_function_id = Some(user_function_id.into());
        self
    }

    pub fn executor(mut self, executor: Arc<dyn TriggerExecutor<T>>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn store(mut self, store: Arc<dyn TrackingStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn options(mut self, options: TriggerOptions) -> Self {
        self.options = options;
        self
    }

    /// Share a metadata cache between listeners.
    pub fn table_info_cache(mut self, cache: Arc<TableInfoCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<TriggerListener<T>> {
        let connection_string = self
            .connection_string
            .ok_or(TriggerError::MissingArgument("connection_string"))?;
        if connection_string.trim().is_empty() {
            return Err(ConfigurationError::MissingConnectionString.into());
        }
        let table_name = non_empty(self.table_name, "table_name")?;
        let user_function_id = non_empty(self.user_function_id, "user_function_id")?;
        let executor = self
            .executor
            .ok_or(TriggerError::MissingArgument("executor"))?;
        let store = self.store.ok_or(TriggerError::MissingArgument("store"))?;

        self.options.validate()?;
        let table = SqlObject::parse(&table_name)?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let cache = self.cache.unwrap_or_else(|| {
            Arc::new(TableInfoCache::new(
                self.options.table_info_cache_timeout,
                clock.clone(),
            ))
        });

        Ok(TriggerListener {
            connection_string,
            table,
            user_function_id,
            options: self.options,
            executor,
            store,
            cache,
            clock,
            state: Mutex::new(ListenerState::Created),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            running: Mutex::new(None),
        })
    }
}

fn non_empty(value: Option<String>, name: &'static str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(TriggerError::MissingArgument(name)),
    }
}

/// Watches one table for one user function.
pub struct TriggerListener<T> {
    connection_string: String,
    table: SqlObject,
    user_function_id: String,
    options: TriggerOptions,
    executor: Arc<dyn TriggerExecutor<T>>,
    store: Arc<dyn TrackingStore>,
    cache: Arc<TableInfoCache>,
    clock: Arc<dyn Clock>,
    state: Mutex<ListenerState>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    running: Mutex<Option<RunningTrigger>>,
}

impl<T> TriggerListener<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn builder() -> TriggerListenerBuilder<T> {
        TriggerListenerBuilder::default()
    }

    pub fn state(&self) -> ListenerState {
        *lock(&self.state)
    }

    /// Resolve the table, prepare the bookkeeping tables and start polling.
    ///
    /// Configuration errors are returned here and leave the listener in
    /// `Created`.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if *state != ListenerState::Created {
                return Err(TriggerError::InvalidState(format!(
                    "cannot start a listener that is {:?}",
                    *state
                )));
            }
            *state = ListenerState::Starting;
        }

        info!(
            "Starting SQL trigger listener for table {} (function {})",
            self.table, self.user_function_id
        );

        match self.start_polling().await {
            Ok(()) => {
                *lock(&self.state) = ListenerState::Running;
                info!("SQL trigger listener for table {} started", self.table);
                Ok(())
            }
            Err(e) => {
                *lock(&self.state) = ListenerState::Created;
                error!(
                    "Failed to start SQL trigger listener for table {}: {e}",
                    self.table
                );
                Err(e)
            }
        }
    }

    async fn start_polling(&self) -> Result<()> {
        let table = Arc::new(
            self.cache
                .get_or_resolve(&self.connection_string, self.store.as_ref(), &self.table)
                .await?,
        );

        let mut scope = TriggerScope::new(self.user_function_id.clone(), table.object_id);
        if let Some(name) = &self.options.leases_table_name {
            scope = scope.with_leases_table(name.clone());
        }

        self.store.initialize(&scope, &table).await?;

        let processor = BatchProcessor::new(
            self.store.clone(),
            scope.clone(),
            table.clone(),
            self.options.clone(),
            self.executor.clone(),
        );
        let poller = ChangePoller::new(
            self.store.clone(),
            scope.clone(),
            table.clone(),
            self.options.clone(),
            processor,
        );
        let poll_state = poller.subscribe();
        let handle = tokio::spawn(poller.run(self.cancel.clone()));

        *lock(&self.task) = Some(handle);
        *lock(&self.running) = Some(RunningTrigger {
            scope,
            table,
            poll_state,
        });
        Ok(())
    }

    /// Cancel polling, wait for the in-flight tick and close the store.
    ///
    /// Calling it again, or on a listener that never started, does nothing.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            match *state {
                ListenerState::Running => *state = ListenerState::Stopping,
                ListenerState::Created => {
                    *state = ListenerState::Stopped;
                    return Ok(());
                }
                ListenerState::Stopping | ListenerState::Stopped => return Ok(()),
                ListenerState::Starting => {
                    return Err(TriggerError::InvalidState(
                        "cannot stop a listener while it is starting".to_string(),
                    ))
                }
            }
        }

        info!("Stopping SQL trigger listener for table {}", self.table);
        self.cancel.cancel();

        let handle = lock(&self.task).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Poll task for table {} ended abnormally: {e}", self.table);
            }
        }

        if let Err(e) = self.store.close().await {
            warn!("Failed to close store for table {}: {e}", self.table);
        }

        *lock(&self.state) = ListenerState::Stopped;
        info!("SQL trigger listener for table {} stopped", self.table);
        Ok(())
    }

    /// Release everything. Safe to call repeatedly and after `stop`.
    pub async fn dispose(&self) -> Result<()> {
        self.stop().await
    }

    pub fn poll_state(&self) -> Option<watch::Receiver<PollState>> {
        lock(&self.running).as_ref().map(|r| r.poll_state.clone())
    }

    pub fn watched_table(&self) -> Option<Arc<WatchedTable>> {
        lock(&self.running).as_ref().map(|r| r.table.clone())
    }

    pub fn scope(&self) -> Option<TriggerScope> {
        lock(&self.running).as_ref().map(|r| r.scope.clone())
    }

    /// Backlog sampler for this trigger. Requires a started listener.
    pub fn metrics_provider(&self) -> Result<Arc<StoreMetricsProvider>> {
        let running = lock(&self.running);
        let running = running.as_ref().ok_or_else(|| {
            TriggerError::InvalidState("metrics require a started listener".to_string())
        })?;
        Ok(Arc::new(StoreMetricsProvider::new(
            self.store.clone(),
            running.scope.clone(),
            running.table.clone(),
            self.options.clone(),
            self.clock.clone(),
        )))
    }

    pub fn scale_monitor(&self) -> Result<ScaleMonitor> {
        Ok(ScaleMonitor::new(
            &self.user_function_id,
            &self.table.to_string(),
            self.options.max_changes_per_worker,
            self.metrics_provider()?,
        ))
    }

    pub fn target_scaler(&self) -> Result<TargetScaler> {
        Ok(TargetScaler::new(
            &self.user_function_id,
            &self.table.to_string(),
            self.options.max_changes_per_worker,
            self.metrics_provider()?,
        ))
    }
}

impl<T> Drop for TriggerListener<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn lock<S>(mutex: &Mutex<S>) -> MutexGuard<'_, S> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
