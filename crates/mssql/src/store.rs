//! [`TableCatalog`] and [`LeaseStore`] over SQL Server.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use sql_trigger_change_tracking::options::DEFAULT_APP_LOCK_TIMEOUT;
use sql_trigger_change_tracking::{
    LeaseAcquisition, LeaseStore, ReleaseOutcome, TableCatalog, TriggerOptions,
};
use std::time::Duration;
use tiberius::{Row, ToSql};
use tracing::{debug, warn};
use trigger_core::{
    ChangeBatch, ChangeRow, ColumnDefinition, ConfigurationError, PrimaryKey, Result,
    SqlChangeOperation, SqlObject, TrackedChange, TriggerError, TriggerScope, WatchedTable,
    LEASES_ATTEMPT_COUNT_COLUMN,
};

use crate::client::{server_error_code, MssqlClient};
use crate::convert::{changes_json, has_column, keys_json, row_key, row_to_change_row};
use crate::sql::{self, ScopeSql, LOCK_FLAG_COLUMN, OPERATION_COLUMN, VERSION_FIELD};

/// "There is already an object named ..." and primary key violations, both
/// raised when two workers initialize the same scope at once.
const ALREADY_EXISTS_ERRORS: [u32; 2] = [2714, 2627];

/// Change tracking store backed by one SQL Server connection.
pub struct MssqlTrackingStore {
    client: MssqlClient,
    init_lock_timeout: Duration,
}

impl MssqlTrackingStore {
    /// Create a store for an ADO.NET style connection string. No connection
    /// is opened until the first query.
    pub fn new(connection_string: &str) -> Result<Self> {
        if connection_string.trim().is_empty() {
            return Err(ConfigurationError::MissingConnectionString.into());
        }
        let client = MssqlClient::from_connection_string(connection_string).map_err(|e| {
            ConfigurationError::InvalidSetting {
                key: "connection_string".to_string(),
                value: "<redacted>".to_string(),
                reason: format!("{e:#}"),
            }
        })?;
        Ok(Self {
            client,
            init_lock_timeout: DEFAULT_APP_LOCK_TIMEOUT,
        })
    }

    /// Lock wait used while creating the bookkeeping tables.
    pub fn with_init_lock_timeout(mut self, timeout: Duration) -> Self {
        self.init_lock_timeout = timeout;
        self
    }

    pub fn client(&self) -> &MssqlClient {
        &self.client
    }

    async fn rows(&self, sql: &str, params: &[&dyn ToSql]) -> anyhow::Result<Vec<Row>> {
        Ok(self
            .client
            .query(sql, params)
            .await?
            .into_iter()
            .flatten()
            .collect())
    }

    async fn batch_rows(&self, sql: &str) -> anyhow::Result<Vec<Row>> {
        Ok(self.client.batch(sql).await?.into_iter().flatten().collect())
    }

    async fn column_definitions(
        &self,
        sql: &str,
        table_id: i32,
    ) -> anyhow::Result<Vec<ColumnDefinition>> {
        self.rows(sql, &[&table_id])
            .await?
            .iter()
            .map(|row| -> anyhow::Result<ColumnDefinition> {
                let name: &str = row.try_get("name")?.context("column name is NULL")?;
                let type_name: &str = row.try_get("type_name")?.context("type name is NULL")?;
                let max_length: i16 = row.try_get("max_length")?.unwrap_or_default();
                let precision: u8 = row.try_get("precision")?.unwrap_or_default();
                let scale: u8 = row.try_get("scale")?.unwrap_or_default();
                Ok(ColumnDefinition::from_catalog(
                    name, type_name, max_length, precision, scale,
                ))
            })
            .collect()
    }

    async fn try_acquire(
        &self,
        scope: &TriggerScope,
        table: &WatchedTable,
        options: &TriggerOptions,
    ) -> anyhow::Result<LeaseAcquisition> {
        let statement = ScopeSql::new(scope, table).acquire_changes(options);
        let rows = self.batch_rows(&statement).await?;

        let locked = rows
            .iter()
            .find(|row| has_column(row, LOCK_FLAG_COLUMN))
            .ok_or_else(|| anyhow!("lease acquisition returned no lock status"))?
            .try_get::<bool, _>(LOCK_FLAG_COLUMN)?
            .unwrap_or(false);
        if !locked {
            return Ok(LeaseAcquisition::Busy);
        }

        let mut changes = Vec::new();
        for row in rows.iter().filter(|row| has_column(row, VERSION_FIELD)) {
            let version: i64 = row
                .try_get(VERSION_FIELD)?
                .context("SYS_CHANGE_VERSION is NULL")?;
            let code: &str = row
                .try_get(OPERATION_COLUMN)?
                .context("SYS_CHANGE_OPERATION is NULL")?;
            let operation = SqlChangeOperation::from_change_tracking_code(code)
                .ok_or_else(|| anyhow!("unknown change operation '{code}'"))?;
            let attempt_count: i32 = row
                .try_get(LEASES_ATTEMPT_COUNT_COLUMN)?
                .unwrap_or(1);
            changes.push(TrackedChange {
                key: row_key(row, table)?,
                version,
                operation,
                attempt_count,
            });
        }
        Ok(LeaseAcquisition::Acquired(ChangeBatch::new(changes)))
    }
}

#[async_trait]
impl TableCatalog for MssqlTrackingStore {
    async fn table_id(&self, table: &SqlObject) -> Result<Option<i32>> {
        let name = table.bracketed();
        let rows = self
            .rows(sql::TABLE_ID, &[&name.as_str()])
            .await
            .map_err(TriggerError::database)?;
        match rows.first() {
            Some(row) => row.try_get::<i32, _>(0).map_err(TriggerError::database),
            None => Ok(None),
        }
    }

    async fn change_tracking_min_valid_version(&self, table_id: i32) -> Result<Option<i64>> {
        let rows = self
            .rows(sql::MIN_VALID_VERSION, &[&table_id])
            .await
            .map_err(TriggerError::database)?;
        match rows.first() {
            Some(row) => row.try_get::<i64, _>(0).map_err(TriggerError::database),
            None => Ok(None),
        }
    }

    async fn primary_key_columns(&self, table_id: i32) -> Result<Vec<ColumnDefinition>> {
        self.column_definitions(sql::PRIMARY_KEY_COLUMNS, table_id)
            .await
            .map_err(TriggerError::database)
    }

    async fn columns(&self, table_id: i32) -> Result<Vec<ColumnDefinition>> {
        self.column_definitions(sql::COLUMNS, table_id)
            .await
            .map_err(TriggerError::database)
    }
}

#[async_trait]
impl LeaseStore for MssqlTrackingStore {
    async fn initialize(&self, scope: &TriggerScope, table: &WatchedTable) -> Result<()> {
        let statement = ScopeSql::new(scope, table).initialize(self.init_lock_timeout);
        match self.client.batch(&statement).await {
            Ok(_) => {
                debug!(
                    "Initialized trigger bookkeeping for table {} in {}",
                    table.object,
                    scope.leases_table_name()
                );
                Ok(())
            }
            Err(e) if server_error_code(&e).is_some_and(|c| ALREADY_EXISTS_ERRORS.contains(&c)) => {
                warn!(
                    "Trigger bookkeeping for table {} was created concurrently: {e}",
                    table.object
                );
                Ok(())
            }
            Err(e) => Err(TriggerError::database(
                e.context(format!("Failed to initialize trigger tables for {}", table.object)),
            )),
        }
    }

    async fn acquire_changes(
        &self,
        scope: &TriggerScope,
        table: &WatchedTable,
        options: &TriggerOptions,
    ) -> Result<LeaseAcquisition> {
        self.try_acquire(scope, table, options)
            .await
            .map_err(|e| TriggerError::database(e.context("Failed to acquire change leases")))
    }

    async fn fetch_rows(
        &self,
        table: &WatchedTable,
        keys: &[PrimaryKey],
    ) -> Result<Vec<(PrimaryKey, ChangeRow)>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let payload = keys_json(table, keys.iter().map(|key| (key, None)));
        let rows = self
            .rows(&sql::fetch_rows(table), &[&payload])
            .await
            .map_err(TriggerError::database)?;

        let mut fetched = Vec::with_capacity(rows.len());
        for row in rows {
            let key = row_key(&row, table).map_err(|e| TriggerError::RowMapping {
                table: table.object.to_string(),
                reason: format!("{e:#}"),
            })?;
            let values = row_to_change_row(row).map_err(|e| TriggerError::RowMapping {
                table: table.object.to_string(),
                reason: format!("{e:#}"),
            })?;
            fetched.push((key, values));
        }
        Ok(fetched)
    }

    async fn renew_leases(
        &self,
        scope: &TriggerScope,
        table: &WatchedTable,
        batch: &ChangeBatch,
        lease_duration: Duration,
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let payload = keys_json(table, batch.keys().map(|key| (key, None)));
        let statement = ScopeSql::new(scope, table).renew_leases(lease_duration);
        self.rows(&statement, &[&payload])
            .await
            .map_err(|e| TriggerError::database(e.context("Failed to renew leases")))?;
        Ok(())
    }

    async fn release_leases(
        &self,
        scope: &TriggerScope,
        table: &WatchedTable,
        batch: &ChangeBatch,
        options: &TriggerOptions,
    ) -> Result<ReleaseOutcome> {
        if batch.is_empty() {
            return Ok(ReleaseOutcome::default());
        }
        let payload = changes_json(table, batch.iter());
        let statement =
            ScopeSql::new(scope, table).release_leases(batch.cursor_candidate(), options);
        let rows = self
            .rows(&statement, &[&payload])
            .await
            .map_err(|e| TriggerError::database(e.context("Failed to release leases")))?;

        let Some(row) = rows.iter().find(|row| has_column(row, "released")) else {
            return Err(TriggerError::database("lease release returned no outcome"));
        };
        let released: i32 = row
            .try_get("released")
            .map_err(TriggerError::database)?
            .unwrap_or(0);
        let new_sync_version: Option<i64> = row
            .try_get("new_sync_version")
            .map_err(TriggerError::database)?;
        Ok(ReleaseOutcome {
            released: usize::try_from(released).unwrap_or(0),
            new_sync_version,
        })
    }

    async fn unprocessed_change_count(
        &self,
        scope: &TriggerScope,
        table: &WatchedTable,
        options: &TriggerOptions,
    ) -> Result<i64> {
        let statement =
            ScopeSql::new(scope, table).unprocessed_change_count(options.max_attempt_count);
        let rows = self
            .batch_rows(&statement)
            .await
            .map_err(TriggerError::database)?;
        let count = rows
            .first()
            .map(|row| row.try_get::<i64, _>("unprocessed_change_count"))
            .transpose()
            .map_err(TriggerError::database)?
            .flatten()
            .unwrap_or(0);
        Ok(count)
    }

    async fn close(&self) -> Result<()> {
        self.client.close().await.map_err(TriggerError::database)
    }
}
