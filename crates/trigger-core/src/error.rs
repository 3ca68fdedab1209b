//! Error types for the change-tracking trigger.
//!
//! Configuration and argument errors are fatal and surface synchronously from
//! listener construction and start-up. Database and callback errors are
//! recoverable: the poll loop logs them at the tick boundary and carries on.

use thiserror::Error;

/// A violated precondition that prevents a trigger from starting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// No connection string was configured for the trigger.
    #[error("No connection string was provided for the SQL trigger")]
    MissingConnectionString,

    /// The table name could not be parsed as `[schema].[table]`.
    #[error("Invalid table name '{name}': {reason}")]
    InvalidTableName { name: String, reason: String },

    /// The monitored table does not exist.
    #[error("Could not find table: '{table}'")]
    TableNotFound { table: String },

    /// Change tracking is not enabled on the database or the table.
    #[error(
        "Could not find change tracking enabled for table: '{table}'. \
         Enable change tracking on both the database and the table"
    )]
    ChangeTrackingDisabled { table: String },

    /// The monitored table has no primary key.
    #[error(
        "Could not find primary key created in table: '{table}'. \
         A primary key is required on every table monitored for changes"
    )]
    NoPrimaryKey { table: String },

    /// A primary key column shares its name with a leases-table bookkeeping column.
    #[error(
        "Primary key column '{column}' of table '{table}' conflicts with the reserved \
         leases table column '{reserved}'"
    )]
    ReservedColumnName {
        table: String,
        column: String,
        reserved: String,
    },

    /// A column uses a SQL type the trigger cannot carry.
    #[error("Column '{column}' of table '{table}' has unsupported type '{sql_type}'")]
    UnsupportedColumnType {
        table: String,
        column: String,
        sql_type: String,
    },

    /// A numeric or duration setting is out of range or unparseable.
    #[error("Invalid value '{value}' for setting '{key}': {reason}")]
    InvalidSetting {
        key: String,
        value: String,
        reason: String,
    },
}

/// Errors produced by the trigger engine.
#[derive(Debug, Error)]
pub enum TriggerError {
    /// Fatal configuration problem, reported at start-up.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// A required constructor argument was not supplied.
    #[error("Required argument '{0}' is missing or empty")]
    MissingArgument(&'static str),

    /// A lifecycle method was called in a state that does not allow it.
    #[error("Invalid listener state: {0}")]
    InvalidState(String),

    /// Connection or query failure; the current tick is aborted.
    #[error("Transient database error: {0}")]
    TransientDatabase(String),

    /// The user function failed; the batch is redelivered after lease expiry.
    #[error("Function execution failed: {0}")]
    CallbackExecution(String),

    /// A row could not be mapped onto the user type.
    #[error("Failed to map row of table '{table}': {reason}")]
    RowMapping { table: String, reason: String },
}

impl TriggerError {
    /// Wrap any backend failure as a transient database error.
    ///
    /// The alternate formatter is used so `anyhow` context chains are kept.
    pub fn database(err: impl std::fmt::Display) -> Self {
        TriggerError::TransientDatabase(format!("{err:#}"))
    }

    /// Whether this error must stop the listener from starting.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TriggerError::Configuration(_) | TriggerError::MissingArgument(_)
        )
    }
}

/// Result type for trigger operations.
pub type Result<T> = std::result::Result<T, TriggerError>;
