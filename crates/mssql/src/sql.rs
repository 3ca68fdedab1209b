//! T-SQL statement builders.
//!
//! Identifiers are bracket-quoted and literals single-quoted; key values
//! never appear in statement text. Statements that act on specific rows take
//! their keys as a JSON array in `@P1` and unpack it with `OPENJSON`.

use sql_trigger_change_tracking::TriggerOptions;
use std::time::Duration;
use trigger_core::{
    bracket_quote, quote_literal, TriggerScope, WatchedTable, GLOBAL_STATE_TABLE,
    LEASES_ATTEMPT_COUNT_COLUMN, LEASES_CHANGE_VERSION_COLUMN, LEASES_EXPIRATION_TIME_COLUMN,
    SCHEMA_NAME,
};

/// JSON field carrying a change version in `@P1` payloads.
pub const VERSION_FIELD: &str = "SYS_CHANGE_VERSION";

/// Result column reporting whether `sp_getapplock` succeeded.
pub const LOCK_FLAG_COLUMN: &str = "lock_acquired";

pub const OPERATION_COLUMN: &str = "SYS_CHANGE_OPERATION";

/// Object id of a user table, NULL if it does not exist.
pub const TABLE_ID: &str = "SELECT OBJECT_ID(@P1, N'U') AS object_id;";

/// NULL when change tracking is not enabled on the table.
pub const MIN_VALID_VERSION: &str =
    "SELECT CHANGE_TRACKING_MIN_VALID_VERSION(@P1) AS min_valid_version;";

pub const PRIMARY_KEY_COLUMNS: &str = "\
SELECT c.name, t.name AS type_name, c.max_length, c.precision, c.scale
FROM sys.indexes AS i
INNER JOIN sys.index_columns AS ic ON i.object_id = ic.object_id AND i.index_id = ic.index_id
INNER JOIN sys.columns AS c ON ic.object_id = c.object_id AND c.column_id = ic.column_id
INNER JOIN sys.types AS t ON c.user_type_id = t.user_type_id
WHERE i.is_primary_key = 1 AND i.object_id = @P1
ORDER BY ic.key_ordinal;";

pub const COLUMNS: &str = "\
SELECT c.name, t.name AS type_name, c.max_length, c.precision, c.scale
FROM sys.columns AS c
INNER JOIN sys.types AS t ON c.user_type_id = t.user_type_id
WHERE c.object_id = @P1
ORDER BY c.column_id;";

/// What to do when the application lock cannot be taken in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnLockTimeout {
    /// Roll back and report `lock_acquired = 0`.
    Report,
    /// Roll back and raise an error.
    Throw,
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis())
        .unwrap_or(i64::MAX)
        .min(i64::from(i32::MAX))
}

/// Column list with an optional alias prefix: `c.[A], c.[B]`.
fn column_list<'a>(alias: &str, names: impl Iterator<Item = &'a str>) -> String {
    names
        .map(|name| {
            if alias.is_empty() {
                bracket_quote(name)
            } else {
                format!("{alias}.{}", bracket_quote(name))
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// `l.[A] = c.[A] AND l.[B] = c.[B]`.
fn key_join(table: &WatchedTable, left: &str, right: &str) -> String {
    table
        .primary_key_names()
        .map(|name| {
            let column = bracket_quote(name);
            format!("{left}.{column} = {right}.{column}")
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// JSON path selecting a top-level property, quoted for arbitrary names.
fn json_path(name: &str) -> String {
    let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
    quote_literal(&format!("$.\"{escaped}\""))
}

/// `OPENJSON(@P1) WITH (...)` over the key columns, plus the change version
/// when `with_version` is set.
fn openjson_keys(table: &WatchedTable, with_version: bool) -> String {
    let mut columns: Vec<String> = table
        .primary_keys
        .iter()
        .map(|c| format!("{} {} {}", bracket_quote(&c.name), c.sql_type, json_path(&c.name)))
        .collect();
    if with_version {
        columns.push(format!(
            "{} bigint {}",
            bracket_quote(VERSION_FIELD),
            json_path(VERSION_FIELD)
        ));
    }
    format!("OPENJSON(@P1) WITH ({})", columns.join(", "))
}

/// Current rows for the keys in `@P1`.
pub fn fetch_rows(table: &WatchedTable) -> String {
    let columns = column_list("u", table.columns.iter().map(|c| c.name.as_str()));
    format!(
        "SELECT {columns}\nFROM {} AS u\nINNER JOIN {} AS k ON {};",
        table.object.bracketed(),
        openjson_keys(table, false),
        key_join(table, "u", "k"),
    )
}

/// Statements over one trigger scope's bookkeeping.
pub struct ScopeSql<'a> {
    scope: &'a TriggerScope,
    table: &'a WatchedTable,
}

impl<'a> ScopeSql<'a> {
    pub fn new(scope: &'a TriggerScope, table: &'a WatchedTable) -> Self {
        Self { scope, table }
    }

    fn leases_table(&self) -> String {
        self.scope.leases_table_name()
    }

    fn global_state_filter(&self) -> String {
        format!(
            "UserFunctionID = {} AND UserTableID = {}",
            quote_literal(&self.scope.user_function_id),
            self.table.object_id
        )
    }

    fn begin_locked(&self, timeout: Duration, on_timeout: OnLockTimeout) -> String {
        let bail_out = match on_timeout {
            OnLockTimeout::Report => format!(
                "    ROLLBACK TRANSACTION;\n    SELECT CAST(0 AS bit) AS {LOCK_FLAG_COLUMN};\n    RETURN;"
            ),
            OnLockTimeout::Throw => "    ROLLBACK TRANSACTION;\n    \
                 THROW 51000, 'Timed out waiting for the trigger application lock.', 1;"
                .to_string(),
        };
        format!(
            "SET XACT_ABORT ON;\n\
             SET NOCOUNT ON;\n\
             BEGIN TRANSACTION;\n\
             DECLARE @lock_result int;\n\
             EXEC @lock_result = sp_getapplock\n    \
                 @Resource = {},\n    \
                 @LockMode = 'Exclusive',\n    \
                 @LockOwner = 'Transaction',\n    \
                 @LockTimeout = {};\n\
             IF @lock_result < 0\n\
             BEGIN\n\
             {bail_out}\n\
             END;\n",
            quote_literal(&self.scope.app_lock_resource()),
            millis(timeout),
        )
    }

    /// Rows that a poll may lease: no live lease and an older recorded
    /// version, or an expired lease, and attempts left.
    fn available_predicate(&self, max_attempt_count: u32) -> String {
        format!(
            "((l.{exp} IS NULL AND (l.{cv} IS NULL OR l.{cv} < c.SYS_CHANGE_VERSION)) \
             OR l.{exp} < SYSUTCDATETIME()) \
             AND (l.{ac} IS NULL OR l.{ac} < {max_attempt_count})",
            exp = bracket_quote(LEASES_EXPIRATION_TIME_COLUMN),
            cv = bracket_quote(LEASES_CHANGE_VERSION_COLUMN),
            ac = bracket_quote(LEASES_ATTEMPT_COUNT_COLUMN),
        )
    }

    /// Load the scope's cursor into `@last_sync_version`, clamped to the
    /// table's minimum valid version.
    fn load_cursor(&self) -> String {
        format!(
            "DECLARE @min_valid_version bigint = CHANGE_TRACKING_MIN_VALID_VERSION({id});\n\
             DECLARE @last_sync_version bigint;\n\
             SELECT @last_sync_version = LastSyncVersion FROM {gs} WHERE {filter};\n\
             IF @last_sync_version < @min_valid_version\n    \
                 SET @last_sync_version = @min_valid_version;\n",
            id = self.table.object_id,
            gs = GLOBAL_STATE_TABLE,
            filter = self.global_state_filter(),
        )
    }

    /// Create the schema, the GlobalState table, this scope's cursor row and
    /// the leases table, all if missing, under the application lock.
    pub fn initialize(&self, lock_timeout: Duration) -> String {
        let schema = bracket_quote(SCHEMA_NAME);
        let key_columns = self
            .table
            .primary_keys
            .iter()
            .map(|c| format!("    {} {} NOT NULL,\n", bracket_quote(&c.name), c.sql_type))
            .collect::<String>();
        let key_list = column_list("", self.table.primary_key_names());
        let leases = self.leases_table();

        format!(
            "{begin}\
             IF SCHEMA_ID({schema_literal}) IS NULL\n    \
                 EXEC ('CREATE SCHEMA {schema}');\n\
             IF OBJECT_ID({gs_literal}, N'U') IS NULL\n    \
                 CREATE TABLE {gs} (\n        \
                     UserFunctionID char(16) NOT NULL,\n        \
                     UserTableID int NOT NULL,\n        \
                     LastSyncVersion bigint NOT NULL,\n        \
                     LastAccessTime datetime2 NOT NULL DEFAULT SYSUTCDATETIME(),\n        \
                     PRIMARY KEY (UserFunctionID, UserTableID)\n    \
                 );\n\
             IF NOT EXISTS (SELECT * FROM {gs} WHERE {filter})\n    \
                 INSERT INTO {gs} (UserFunctionID, UserTableID, LastSyncVersion, LastAccessTime)\n    \
                 VALUES ({fid}, {id}, CHANGE_TRACKING_MIN_VALID_VERSION({id}), SYSUTCDATETIME());\n\
             IF OBJECT_ID({leases_literal}, N'U') IS NULL\n    \
                 CREATE TABLE {leases} (\n\
             {key_columns}    \
                     {cv} bigint NOT NULL,\n    \
                     {ac} int NOT NULL,\n    \
                     {exp} datetime2 NULL,\n    \
                     PRIMARY KEY ({key_list})\n    \
                 );\n\
             COMMIT TRANSACTION;",
            begin = self.begin_locked(lock_timeout, OnLockTimeout::Throw),
            schema_literal = quote_literal(SCHEMA_NAME),
            gs_literal = quote_literal(GLOBAL_STATE_TABLE),
            gs = GLOBAL_STATE_TABLE,
            filter = self.global_state_filter(),
            fid = quote_literal(&self.scope.user_function_id),
            id = self.table.object_id,
            leases_literal = quote_literal(&leases),
            cv = bracket_quote(LEASES_CHANGE_VERSION_COLUMN),
            ac = bracket_quote(LEASES_ATTEMPT_COUNT_COLUMN),
            exp = bracket_quote(LEASES_EXPIRATION_TIME_COLUMN),
        )
    }

    /// One poll: take the lock, bump a stale cursor, pick the next
    /// changes and lease them.
    ///
    /// Produces a `lock_acquired` row, then (when locked) one row per leased
    /// change with its key columns, version, operation and attempt count.
    pub fn acquire_changes(&self, options: &TriggerOptions) -> String {
        let keys_c = column_list("c", self.table.primary_key_names());
        let key_list = column_list("", self.table.primary_key_names());
        let cv = bracket_quote(LEASES_CHANGE_VERSION_COLUMN);
        let ac = bracket_quote(LEASES_ATTEMPT_COUNT_COLUMN);
        let exp = bracket_quote(LEASES_EXPIRATION_TIME_COLUMN);
        let lease_ms = millis(options.lease_duration);

        format!(
            "{begin}\
             SELECT CAST(1 AS bit) AS {LOCK_FLAG_COLUMN};\n\
             DECLARE @min_valid_version bigint = CHANGE_TRACKING_MIN_VALID_VERSION({id});\n\
             UPDATE {gs} SET LastSyncVersion = @min_valid_version, LastAccessTime = SYSUTCDATETIME()\n\
             WHERE {filter} AND LastSyncVersion < @min_valid_version;\n\
             DECLARE @last_sync_version bigint;\n\
             SELECT @last_sync_version = LastSyncVersion FROM {gs} WHERE {filter};\n\
             WITH changes AS (\n    \
                 SELECT TOP ({batch}) {keys_c}, c.SYS_CHANGE_VERSION, c.SYS_CHANGE_OPERATION\n    \
                 FROM CHANGETABLE(CHANGES {table}, @last_sync_version) AS c\n    \
                 LEFT OUTER JOIN {leases} AS l ON {join_lc}\n    \
                 WHERE {available}\n    \
                 ORDER BY c.SYS_CHANGE_VERSION ASC\n\
             )\n\
             MERGE {leases} WITH (TABLOCKX) AS l\n\
             USING changes AS c ON {join_lc}\n\
             WHEN MATCHED THEN UPDATE SET\n    \
                 {cv} = c.SYS_CHANGE_VERSION,\n    \
                 {ac} = l.{ac} + 1,\n    \
                 {exp} = DATEADD(millisecond, {lease_ms}, SYSUTCDATETIME())\n\
             WHEN NOT MATCHED THEN\n    \
                 INSERT ({key_list}, {cv}, {ac}, {exp})\n    \
                 VALUES ({keys_c}, c.SYS_CHANGE_VERSION, 1, DATEADD(millisecond, {lease_ms}, SYSUTCDATETIME()))\n\
             OUTPUT {keys_c}, c.SYS_CHANGE_VERSION, c.SYS_CHANGE_OPERATION, inserted.{ac};\n\
             COMMIT TRANSACTION;",
            begin = self.begin_locked(options.app_lock_timeout, OnLockTimeout::Report),
            id = self.table.object_id,
            gs = GLOBAL_STATE_TABLE,
            filter = self.global_state_filter(),
            batch = options.max_batch_size,
            table = self.table.object.bracketed(),
            leases = self.leases_table(),
            join_lc = key_join(self.table, "l", "c"),
            available = self.available_predicate(options.max_attempt_count),
        )
    }

    /// Extend live leases for the keys in `@P1`.
    pub fn renew_leases(&self, lease_duration: Duration) -> String {
        let exp = bracket_quote(LEASES_EXPIRATION_TIME_COLUMN);
        format!(
            "UPDATE l\n\
             SET {exp} = DATEADD(millisecond, {ms}, SYSUTCDATETIME())\n\
             FROM {leases} AS l\n\
             INNER JOIN {keys} AS k ON {join}\n\
             WHERE l.{exp} IS NOT NULL;",
            ms = millis(lease_duration),
            leases = self.leases_table(),
            keys = openjson_keys(self.table, false),
            join = key_join(self.table, "l", "k"),
        )
    }

    /// Mark the changes in `@P1` processed and, when `candidate` is set and
    /// nothing at or below it is outstanding, advance the cursor to it and
    /// prune the leases it covers.
    ///
    /// Produces one row with `released` and `new_sync_version`.
    pub fn release_leases(&self, candidate: Option<i64>, options: &TriggerOptions) -> String {
        let cv = bracket_quote(LEASES_CHANGE_VERSION_COLUMN);
        let ac = bracket_quote(LEASES_ATTEMPT_COUNT_COLUMN);
        let exp = bracket_quote(LEASES_EXPIRATION_TIME_COLUMN);
        let version = bracket_quote(VERSION_FIELD);
        let leases = self.leases_table();

        let advance = match candidate {
            Some(candidate) => format!(
                "{cursor}\
                 IF {candidate} > @last_sync_version\n\
                 BEGIN\n    \
                     DECLARE @unprocessed_changes bigint;\n    \
                     SELECT @unprocessed_changes = COUNT_BIG(*)\n    \
                     FROM CHANGETABLE(CHANGES {table}, @last_sync_version) AS c\n    \
                     LEFT OUTER JOIN {leases} AS l ON {join_lc}\n    \
                     WHERE c.SYS_CHANGE_VERSION <= {candidate}\n        \
                         AND (l.{cv} IS NULL OR l.{cv} <> c.SYS_CHANGE_VERSION OR l.{exp} IS NOT NULL)\n        \
                         AND (l.{ac} IS NULL OR l.{ac} < {max});\n    \
                     IF @unprocessed_changes = 0\n    \
                     BEGIN\n        \
                         UPDATE {gs} SET LastSyncVersion = {candidate}, LastAccessTime = SYSUTCDATETIME()\n        \
                         WHERE {filter};\n        \
                         DELETE FROM {leases} WHERE {cv} <= {candidate};\n        \
                         SET @new_sync_version = {candidate};\n    \
                     END;\n\
                 END;\n",
                cursor = self.load_cursor(),
                table = self.table.object.bracketed(),
                join_lc = key_join(self.table, "l", "c"),
                max = options.max_attempt_count,
                gs = GLOBAL_STATE_TABLE,
                filter = self.global_state_filter(),
            ),
            None => String::new(),
        };

        format!(
            "{begin}\
             DECLARE @released int;\n\
             DECLARE @new_sync_version bigint = NULL;\n\
             UPDATE l\n\
             SET {cv} = k.{version}, {ac} = 0, {exp} = NULL\n\
             FROM {leases} AS l\n\
             INNER JOIN {keys} AS k ON {join_lk}\n\
             WHERE l.{cv} <= k.{version};\n\
             SET @released = @@ROWCOUNT;\n\
             {advance}\
             COMMIT TRANSACTION;\n\
             SELECT @released AS released, @new_sync_version AS new_sync_version;",
            begin = self.begin_locked(options.app_lock_timeout, OnLockTimeout::Throw),
            keys = openjson_keys(self.table, true),
            join_lk = key_join(self.table, "l", "k"),
        )
    }

    /// Count of changes a poll would lease right now, without a row limit.
    pub fn unprocessed_change_count(&self, max_attempt_count: u32) -> String {
        format!(
            "SET NOCOUNT ON;\n\
             {cursor}\
             SELECT COUNT_BIG(*) AS unprocessed_change_count\n\
             FROM CHANGETABLE(CHANGES {table}, @last_sync_version) AS c\n\
             LEFT OUTER JOIN {leases} AS l ON {join}\n\
             WHERE {available};",
            cursor = self.load_cursor(),
            table = self.table.object.bracketed(),
            leases = self.leases_table(),
            join = key_join(self.table, "l", "c"),
            available = self.available_predicate(max_attempt_count),
        )
    }
}
