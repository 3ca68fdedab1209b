//! In-memory change tracking database

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;
use trigger_core::{
    ChangeBatch, ChangeRow, Clock, ColumnDefinition, ConfigurationError, PrimaryKey, Result,
    SqlChangeOperation, SqlObject, TrackedChange, TriggerError, TriggerScope, WatchedTable,
};

use crate::options::TriggerOptions;
use crate::store::{LeaseAcquisition, LeaseStore, ReleaseOutcome, TableCatalog};

/// A leases table row as seen by tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseSnapshot {
    pub change_version: i64,
    pub attempt_count: i32,
    pub expiration: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
struct TrackedRow {
    created_version: i64,
    last_version: i64,
    deleted: bool,
}

#[derive(Debug)]
struct MemoryTable {
    object: SqlObject,
    object_id: i32,
    primary_keys: Vec<ColumnDefinition>,
    columns: Vec<ColumnDefinition>,
    change_tracking: bool,
    min_valid_version: i64,
    rows: BTreeMap<PrimaryKey, ChangeRow>,
    tracked: BTreeMap<PrimaryKey, TrackedRow>,
}

impl MemoryTable {
    fn watched(&self) -> WatchedTable {
        WatchedTable {
            object: self.object.clone(),
            object_id: self.object_id,
            primary_keys: self.primary_keys.clone(),
            columns: self.columns.clone(),
        }
    }

    /// `CHANGETABLE(CHANGES t, since)` ordered by version.
    fn changes_since(&self, since: i64) -> Vec<(PrimaryKey, i64, SqlChangeOperation)> {
        let mut changes: Vec<_> = self
            .tracked
            .iter()
            .filter(|(_, t)| t.last_version > since)
            .map(|(key, t)| {
                let operation = if t.deleted {
                    SqlChangeOperation::Delete
                } else if t.created_version > since {
                    SqlChangeOperation::Insert
                } else {
                    SqlChangeOperation::Update
                };
                (key.clone(), t.last_version, operation)
            })
            .collect();
        changes.sort_by_key(|(_, version, _)| *version);
        changes
    }
}

#[derive(Debug, Default)]
struct MemoryDatabase {
    version: i64,
    next_object_id: i32,
    tables: Vec<MemoryTable>,
    leases: HashMap<String, BTreeMap<PrimaryKey, LeaseSnapshot>>,
    global_state: HashMap<(String, i32), i64>,
}

impl MemoryDatabase {
    fn table_by_name(&mut self, name: &str) -> Result<&mut MemoryTable> {
        let object = SqlObject::parse(name)?;
        self.tables
            .iter_mut()
            .find(|t| t.object.normalized() == object.normalized())
            .ok_or_else(|| {
                ConfigurationError::TableNotFound {
                    table: object.to_string(),
                }
                .into()
            })
    }

    fn table_by_id(&self, object_id: i32) -> Result<&MemoryTable> {
        self.tables
            .iter()
            .find(|t| t.object_id == object_id)
            .ok_or_else(|| TriggerError::database(format!("Invalid object id {object_id}")))
    }

    fn next_version(&mut self) -> i64 {
        self.version += 1;
        self.version
    }
}

/// Rows a poll may lease: unleased with an older recorded version, or with
/// an expired lease, and below the attempt limit.
fn is_available(
    lease: Option<&LeaseSnapshot>,
    version: i64,
    now: DateTime<Utc>,
    max_attempts: i32,
) -> bool {
    let Some(lease) = lease else {
        return true;
    };
    let free = match lease.expiration {
        None => lease.change_version < version,
        Some(expiration) => expiration < now,
    };
    free && lease.attempt_count < max_attempts
}

/// Rows that still block the cursor from moving past `version`.
fn is_unprocessed(lease: Option<&LeaseSnapshot>, version: i64, max_attempts: i32) -> bool {
    let Some(lease) = lease else {
        return true;
    };
    (lease.change_version != version || lease.expiration.is_some())
        && lease.attempt_count < max_attempts
}

fn scope_key(scope: &TriggerScope) -> (String, i32) {
    (scope.user_function_id.clone(), scope.table_id)
}

fn max_attempts(options: &TriggerOptions) -> i32 {
    i32::try_from(options.max_attempt_count).unwrap_or(i32::MAX)
}

fn lease_expiry(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now)
}

/// Change-tracked tables, leases and cursors held in memory.
///
/// Every DML call bumps a database-wide version counter like SQL Server's
/// change tracking. The application lock is a per-scope async mutex.
#[derive(Debug)]
pub struct MemoryTrackingStore {
    clock: Arc<dyn Clock>,
    db: Mutex<MemoryDatabase>,
    app_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    catalog_lookups: AtomicUsize,
    acquire_failures: AtomicUsize,
    close_count: AtomicUsize,
}

impl MemoryTrackingStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            db: Mutex::new(MemoryDatabase {
                next_object_id: 1000,
                ..Default::default()
            }),
            app_locks: Mutex::new(HashMap::new()),
            catalog_lookups: AtomicUsize::new(0),
            acquire_failures: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
        }
    }

    fn db(&self) -> MutexGuard<'_, MemoryDatabase> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a change-tracked table and return its object id.
    ///
    /// `primary_keys` come first in the column list, followed by `columns`.
    pub fn create_table(
        &self,
        name: &str,
        primary_keys: &[(&str, &str)],
        columns: &[(&str, &str)],
    ) -> i32 {
        let object = SqlObject::parse(name).unwrap_or_else(|_| SqlObject::new("dbo", name));
        let primary_keys: Vec<ColumnDefinition> = primary_keys
            .iter()
            .map(|(n, t)| ColumnDefinition::new(*n, *t))
            .collect();
        let mut all_columns = primary_keys.clone();
        all_columns.extend(columns.iter().map(|(n, t)| ColumnDefinition::new(*n, *t)));

        let mut db = self.db();
        db.next_object_id += 1;
        let object_id = db.next_object_id;
        let min_valid_version = db.version;
        db.tables.push(MemoryTable {
            object,
            object_id,
            primary_keys,
            columns: all_columns,
            change_tracking: true,
            min_valid_version,
            rows: BTreeMap::new(),
            tracked: BTreeMap::new(),
        });
        object_id
    }

    pub fn set_change_tracking(&self, table: &str, enabled: bool) -> Result<()> {
        self.db().table_by_name(table)?.change_tracking = enabled;
        Ok(())
    }

    /// Simulate retention cleanup moving the minimum valid version forward.
    pub fn set_min_valid_version(&self, table: &str, version: i64) -> Result<()> {
        self.db().table_by_name(table)?.min_valid_version = version;
        Ok(())
    }

    /// Insert (or replace) a row and return the change version it produced.
    pub fn insert(&self, table: &str, row: Value) -> Result<i64> {
        let mut db = self.db();
        let version = db.next_version();
        let t = db.table_by_name(table)?;
        let row = json_row(&t.object, row)?;
        let key = row_key(t, &row)?;

        let created_version = match t.tracked.get(&key) {
            Some(existing) if !existing.deleted && t.rows.contains_key(&key) => {
                existing.created_version
            }
            _ => version,
        };
        t.rows.insert(key.clone(), row);
        t.tracked.insert(
            key,
            TrackedRow {
                created_version,
                last_version: version,
                deleted: false,
            },
        );
        Ok(version)
    }

    /// Overwrite the given columns of an existing row.
    pub fn update(&self, table: &str, row: Value) -> Result<i64> {
        let mut db = self.db();
        let version = db.next_version();
        let t = db.table_by_name(table)?;
        let changes = json_row(&t.object, row)?;
        let key = row_key(t, &changes)?;

        let existing = t.rows.get_mut(&key).ok_or_else(|| TriggerError::RowMapping {
            table: t.object.to_string(),
            reason: format!("no row with key {key}"),
        })?;
        for (column, value) in changes.iter() {
            existing.insert(column, value.clone());
        }
        let tracked = t.tracked.entry(key).or_insert(TrackedRow {
            created_version: 0,
            last_version: version,
            deleted: false,
        });
        tracked.last_version = version;
        Ok(version)
    }

    pub fn delete(&self, table: &str, key: PrimaryKey) -> Result<i64> {
        let mut db = self.db();
        let version = db.next_version();
        let t = db.table_by_name(table)?;
        t.rows.remove(&key);
        let tracked = t.tracked.entry(key).or_insert(TrackedRow {
            created_version: 0,
            last_version: version,
            deleted: true,
        });
        tracked.last_version = version;
        tracked.deleted = true;
        Ok(version)
    }

    pub fn current_version(&self) -> i64 {
        self.db().version
    }

    pub fn last_sync_version(&self, scope: &TriggerScope) -> Option<i64> {
        self.db().global_state.get(&scope_key(scope)).copied()
    }

    pub fn lease(&self, scope: &TriggerScope, key: &PrimaryKey) -> Option<LeaseSnapshot> {
        self.db()
            .leases
            .get(&scope.leases_table_name())
            .and_then(|leases| leases.get(key))
            .copied()
    }

    pub fn lease_count(&self, scope: &TriggerScope) -> usize {
        self.db()
            .leases
            .get(&scope.leases_table_name())
            .map_or(0, BTreeMap::len)
    }

    /// Calls to `table_id`, i.e. metadata resolutions that reached the catalog.
    pub fn catalog_lookups(&self) -> usize {
        self.catalog_lookups.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    /// Make the next `count` lease acquisitions fail as if the connection dropped.
    pub fn fail_next_acquires(&self, count: usize) {
        self.acquire_failures.store(count, Ordering::SeqCst);
    }

    /// Hold the scope's application lock, as another worker would.
    pub async fn hold_app_lock(&self, scope: &TriggerScope) -> OwnedMutexGuard<()> {
        self.app_lock(scope).lock_owned().await
    }

    fn app_lock(&self, scope: &TriggerScope) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.app_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(scope.app_lock_resource())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn try_app_lock(
        &self,
        scope: &TriggerScope,
        timeout: Duration,
    ) -> Option<OwnedMutexGuard<()>> {
        tokio::time::timeout(timeout, self.app_lock(scope).lock_owned())
            .await
            .ok()
    }

    fn take_injected_failure(&self) -> bool {
        self.acquire_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn json_row(object: &SqlObject, row: Value) -> Result<ChangeRow> {
    match row {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(TriggerError::RowMapping {
            table: object.to_string(),
            reason: format!("expected a JSON object, got {other}"),
        }),
    }
}

fn row_key(table: &MemoryTable, row: &ChangeRow) -> Result<PrimaryKey> {
    PrimaryKey::from_row(row, &table.watched()).ok_or_else(|| TriggerError::RowMapping {
        table: table.object.to_string(),
        reason: "row is missing a primary key column".to_string(),
    })
}

#[async_trait]
impl TableCatalog for MemoryTrackingStore {
    async fn table_id(&self, table: &SqlObject) -> Result<Option<i32>> {
        self.catalog_lookups.fetch_add(1, Ordering::SeqCst);
        let wanted = table.normalized();
        Ok(self
            .db()
            .tables
            .iter()
            .find(|t| t.object.normalized() == wanted)
            .map(|t| t.object_id))
    }

    async fn change_tracking_min_valid_version(&self, table_id: i32) -> Result<Option<i64>> {
        let db = self.db();
        let table = db.table_by_id(table_id)?;
        Ok(table.change_tracking.then_some(table.min_valid_version))
    }

    async fn primary_key_columns(&self, table_id: i32) -> Result<Vec<ColumnDefinition>> {
        Ok(self.db().table_by_id(table_id)?.primary_keys.clone())
    }

    async fn columns(&self, table_id: i32) -> Result<Vec<ColumnDefinition>> {
        Ok(self.db().table_by_id(table_id)?.columns.clone())
    }
}

#[async_trait]
impl LeaseStore for MemoryTrackingStore {
    async fn initialize(&self, scope: &TriggerScope, table: &WatchedTable) -> Result<()> {
        let mut db = self.db();
        let min_valid_version = db.table_by_id(table.object_id)?.min_valid_version;
        db.global_state
            .entry(scope_key(scope))
            .or_insert(min_valid_version);
        db.leases.entry(scope.leases_table_name()).or_default();
        Ok(())
    }

    async fn acquire_changes(
        &self,
        scope: &TriggerScope,
        table: &WatchedTable,
        options: &TriggerOptions,
    ) -> Result<LeaseAcquisition> {
        if self.take_injected_failure() {
            return Err(TriggerError::database("connection reset by peer"));
        }

        let Some(_lock) = self.try_app_lock(scope, options.app_lock_timeout).await else {
            return Ok(LeaseAcquisition::Busy);
        };

        let now = self.clock.now();
        let max_attempts = max_attempts(options);
        let mut db = self.db();

        let (changes, min_valid_version) = {
            let t = db.table_by_id(table.object_id)?;
            let cursor = db
                .global_state
                .get(&scope_key(scope))
                .copied()
                .ok_or_else(|| TriggerError::database("global state row is missing"))?;
            (t.changes_since(cursor.max(t.min_valid_version)), t.min_valid_version)
        };

        if let Some(cursor) = db.global_state.get_mut(&scope_key(scope)) {
            if *cursor < min_valid_version {
                debug!("Moving sync version from {cursor} to min valid version {min_valid_version}");
                *cursor = min_valid_version;
            }
        }

        let leases = db.leases.entry(scope.leases_table_name()).or_default();
        let limit = usize::try_from(options.max_batch_size).unwrap_or(usize::MAX);
        let expiry = lease_expiry(now, options.lease_duration);

        let mut leased = Vec::new();
        for (key, version, operation) in changes {
            if leased.len() >= limit {
                break;
            }
            if !is_available(leases.get(&key), version, now, max_attempts) {
                continue;
            }
            let lease = leases.entry(key.clone()).or_insert(LeaseSnapshot {
                change_version: version,
                attempt_count: 0,
                expiration: None,
            });
            lease.change_version = version;
            lease.attempt_count += 1;
            lease.expiration = Some(expiry);
            leased.push(TrackedChange {
                key,
                version,
                operation,
                attempt_count: lease.attempt_count,
            });
        }

        Ok(LeaseAcquisition::Acquired(ChangeBatch::new(leased)))
    }

    async fn fetch_rows(
        &self,
        table: &WatchedTable,
        keys: &[PrimaryKey],
    ) -> Result<Vec<(PrimaryKey, ChangeRow)>> {
        let db = self.db();
        let t = db.table_by_id(table.object_id)?;
        Ok(keys
            .iter()
            .filter_map(|key| t.rows.get(key).map(|row| (key.clone(), row.clone())))
            .collect())
    }

    async fn renew_leases(
        &self,
        scope: &TriggerScope,
        _table: &WatchedTable,
        batch: &ChangeBatch,
        lease_duration: Duration,
    ) -> Result<()> {
        let expiry = lease_expiry(self.clock.now(), lease_duration);
        let mut db = self.db();
        if let Some(leases) = db.leases.get_mut(&scope.leases_table_name()) {
            for change in batch.iter() {
                if let Some(lease) = leases.get_mut(&change.key) {
                    if lease.expiration.is_some() {
                        lease.expiration = Some(expiry);
                    }
                }
            }
        }
        Ok(())
    }

    async fn release_leases(
        &self,
        scope: &TriggerScope,
        table: &WatchedTable,
        batch: &ChangeBatch,
        options: &TriggerOptions,
    ) -> Result<ReleaseOutcome> {
        let Some(_lock) = self.try_app_lock(scope, options.app_lock_timeout).await else {
            return Err(TriggerError::database(
                "timed out waiting for the application lock",
            ));
        };

        let max_attempts = max_attempts(options);
        let mut db = self.db();
        let mut outcome = ReleaseOutcome::default();

        let leases = db.leases.entry(scope.leases_table_name()).or_default();
        for change in batch.iter() {
            if let Some(lease) = leases.get_mut(&change.key) {
                if lease.change_version <= change.version {
                    lease.change_version = change.version;
                    lease.attempt_count = 0;
                    lease.expiration = None;
                    outcome.released += 1;
                }
            }
        }

        let Some(candidate) = batch.cursor_candidate() else {
            return Ok(outcome);
        };
        let cursor = db
            .global_state
            .get(&scope_key(scope))
            .copied()
            .ok_or_else(|| TriggerError::database("global state row is missing"))?;
        if candidate <= cursor {
            return Ok(outcome);
        }

        let pending = db.table_by_id(table.object_id)?.changes_since(cursor);
        let leases = db.leases.entry(scope.leases_table_name()).or_default();
        let blocking = pending
            .iter()
            .filter(|(_, version, _)| *version <= candidate)
            .filter(|(key, version, _)| is_unprocessed(leases.get(key), *version, max_attempts))
            .count();
        if blocking > 0 {
            debug!("{blocking} change(s) at or below version {candidate} are still outstanding");
            return Ok(outcome);
        }

        leases.retain(|_, lease| lease.change_version > candidate);
        db.global_state.insert(scope_key(scope), candidate);
        outcome.new_sync_version = Some(candidate);
        Ok(outcome)
    }

    async fn unprocessed_change_count(
        &self,
        scope: &TriggerScope,
        table: &WatchedTable,
        options: &TriggerOptions,
    ) -> Result<i64> {
        let now = self.clock.now();
        let max_attempts = max_attempts(options);
        let db = self.db();
        let t = db.table_by_id(table.object_id)?;
        let cursor = db
            .global_state
            .get(&scope_key(scope))
            .copied()
            .unwrap_or(t.min_valid_version)
            .max(t.min_valid_version);
        let leases = db.leases.get(&scope.leases_table_name());
        let count = t
            .changes_since(cursor)
            .iter()
            .filter(|(key, version, _)| {
                is_available(leases.and_then(|l| l.get(key)), *version, now, max_attempts)
            })
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn close(&self) -> Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
