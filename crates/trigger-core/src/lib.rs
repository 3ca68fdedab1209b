//! Core types for the sql-trigger change-tracking engine.
//!
//! This crate provides the foundational types shared by the engine, the
//! scale components and the SQL Server backend:
//!
//! - [`SqlObject`], [`ColumnDefinition`], [`WatchedTable`] - the monitored table and its metadata
//! - [`PrimaryKey`], [`KeyValue`] - typed primary key tuples used to key leases
//! - [`TrackedChange`], [`ChangeBatch`] - leased changes produced by a poll tick
//! - [`SqlChange`], [`SqlChangeOperation`] - the values delivered to user functions
//! - [`RowMapper`] - the explicit column → user type mapping step
//! - [`TriggerError`], [`ConfigurationError`] - the error taxonomy
//! - [`Clock`] - injectable time source for leases and caches
//!
//! # Architecture
//!
//! ```text
//! trigger-core (this crate)
//!    │
//!    ├─── trigger-scale                (scale votes over metric samples)
//!    │
//!    ├─── sql-trigger-change-tracking  (poll engine, leasing, batch processor, listener)
//!    │
//!    └─── sql-trigger-mssql            (SQL Server store over tiberius)
//! ```

pub mod change;
pub mod clock;
pub mod error;
pub mod identity;
pub mod key;
pub mod mapping;
pub mod table;

// Re-exports for convenience
pub use change::{ChangeBatch, ChangeRow, SqlChange, SqlChangeOperation, TrackedChange};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ConfigurationError, Result, TriggerError};
pub use identity::{user_function_id, TriggerScope, GLOBAL_STATE_TABLE, SCHEMA_NAME};
pub use key::{KeyValue, PrimaryKey};
pub use mapping::RowMapper;
pub use table::{
    bracket_quote, quote_literal, ColumnDefinition, SqlObject, WatchedTable,
    LEASES_ATTEMPT_COUNT_COLUMN, LEASES_CHANGE_VERSION_COLUMN, LEASES_EXPIRATION_TIME_COLUMN,
    RESERVED_COLUMN_NAMES, UNSUPPORTED_COLUMN_TYPES,
};
