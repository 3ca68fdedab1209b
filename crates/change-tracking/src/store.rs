//! Storage traits the engine runs against.
//!
//! A backend provides two capabilities: catalog lookups used to resolve the
//! watched table, and the lease/cursor operations used by the poll loop.
//! Every mutation of leases and the cursor happens inside these calls, so a
//! backend is responsible for making each one transactional.

use async_trait::async_trait;
use std::time::Duration;
use trigger_core::{
    ChangeBatch, ChangeRow, ColumnDefinition, PrimaryKey, Result, SqlObject, TriggerScope,
    WatchedTable,
};

use crate::options::TriggerOptions;

/// Catalog queries used by the table metadata resolver.
#[async_trait]
pub trait TableCatalog: Send + Sync {
    /// Object id of the table, or `None` if it does not exist.
    async fn table_id(&self, table: &SqlObject) -> Result<Option<i32>>;

    /// `CHANGE_TRACKING_MIN_VALID_VERSION`, `None` when change tracking is off.
    async fn change_tracking_min_valid_version(&self, table_id: i32) -> Result<Option<i64>>;

    /// Primary key columns in key ordinal order.
    async fn primary_key_columns(&self, table_id: i32) -> Result<Vec<ColumnDefinition>>;

    async fn columns(&self, table_id: i32) -> Result<Vec<ColumnDefinition>>;
}

/// Result of one lease acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAcquisition {
    /// Another worker holds the application lock; skip this tick.
    Busy,
    /// Leases taken under the lock. May be empty.
    Acquired(ChangeBatch),
}

/// What a successful release did to the scope's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseOutcome {
    /// Lease rows marked processed.
    pub released: usize,
    /// The new cursor, when it advanced.
    pub new_sync_version: Option<i64>,
}

/// Lease and cursor operations driven by the poll loop.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Create the bookkeeping schema, the cursor row and the leases table.
    ///
    /// Idempotent; concurrent workers may call it at the same time.
    async fn initialize(&self, scope: &TriggerScope, table: &WatchedTable) -> Result<()>;

    /// Under the scope's application lock, find unleased or expired changes
    /// newer than the cursor and lease them.
    async fn acquire_changes(
        &self,
        scope: &TriggerScope,
        table: &WatchedTable,
        options: &TriggerOptions,
    ) -> Result<LeaseAcquisition>;

    /// Current rows for `keys`. Keys whose row no longer exists are omitted.
    async fn fetch_rows(
        &self,
        table: &WatchedTable,
        keys: &[PrimaryKey],
    ) -> Result<Vec<(PrimaryKey, ChangeRow)>>;

    /// Push the expiry of the batch's leases to `now + lease_duration`.
    async fn renew_leases(
        &self,
        scope: &TriggerScope,
        table: &WatchedTable,
        batch: &ChangeBatch,
        lease_duration: Duration,
    ) -> Result<()>;

    /// Mark the batch processed and advance the cursor when nothing older
    /// than the batch's cursor candidate is still outstanding.
    async fn release_leases(
        &self,
        scope: &TriggerScope,
        table: &WatchedTable,
        batch: &ChangeBatch,
        options: &TriggerOptions,
    ) -> Result<ReleaseOutcome>;

    /// Changes that a poll would currently lease, without a row limit.
    async fn unprocessed_change_count(
        &self,
        scope: &TriggerScope,
        table: &WatchedTable,
        options: &TriggerOptions,
    ) -> Result<i64>;

    /// Release connections. Safe to call more than once.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A backend providing both catalog and lease operations.
pub trait TrackingStore: TableCatalog + LeaseStore {}

impl<S: TableCatalog + LeaseStore + ?Sized> TrackingStore for S {}
