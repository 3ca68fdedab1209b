//! sql-trigger library
//!
//! Command-line argument types for the `sql-trigger` binary, which runs the
//! SQL Server change tracking trigger from a terminal.
//!
//! # Crates
//!
//! - `trigger_core` - tables, keys, changes and the error taxonomy
//! - `trigger_scale` - scale votes and target worker counts
//! - `sql_trigger_change_tracking` - poll engine, leasing and the listener
//! - `sql_trigger_mssql` - the SQL Server store
//!
//! # CLI Usage
//!
//! ```bash
//! # Print every change to dbo.Products as a JSON line
//! sql-trigger watch --connection-string "Server=...;Database=shop;..." --table dbo.Products
//!
//! # Sample the backlog five times and print the scale votes
//! sql-trigger scale --table dbo.Products --samples 5 --interval 1s
//!
//! # Desired worker count for the current backlog
//! sql-trigger target --table dbo.Products --instance-concurrency 500
//! ```

use clap::Parser;
use sql_trigger_change_tracking::options::{BATCH_SIZE_SETTING, MAX_BATCH_SIZE_SETTING};
use sql_trigger_change_tracking::TriggerOptions;
use std::time::Duration;
use trigger_core::ConfigurationError;

pub mod config;

use config::parse_duration;

#[derive(Parser, Clone, Debug)]
pub struct ConnectionArgs {
    /// SQL Server connection string (ADO.NET format)
    #[arg(long, env = "SqlConnectionString", hide_env_values = true)]
    pub connection_string: String,

    /// Table to monitor, e.g. dbo.Products
    #[arg(long)]
    pub table: String,
}

#[derive(Parser, Clone, Debug)]
pub struct TriggerArgs {
    /// Function name; with the host id it identifies the workers sharing leases
    #[arg(long, default_value = "sql-trigger", env = "SQL_TRIGGER_FUNCTION_NAME")]
    pub function_name: String,

    /// Host id; with the function name it identifies the workers sharing leases
    #[arg(long, default_value = "localhost", env = "SQL_TRIGGER_HOST_ID")]
    pub host_id: String,

    /// Maximum changes leased per poll
    #[arg(long, env = "Sql_Trigger_MaxBatchSize")]
    pub max_batch_size: Option<u32>,

    /// Deprecated alias of --max-batch-size
    #[arg(long, env = "Sql_Trigger_BatchSize", hide = true)]
    pub batch_size: Option<u32>,

    /// Delay between polls (e.g. "500ms", "2s"; plain numbers are milliseconds)
    #[arg(long, env = "Sql_Trigger_PollingIntervalMs", value_parser = parse_duration)]
    pub polling_interval: Option<Duration>,

    /// Unprocessed changes one worker is expected to handle
    #[arg(long, env = "Sql_Trigger_MaxChangesPerWorker")]
    pub max_changes_per_worker: Option<u32>,

    /// How long a leased change is reserved for this worker
    #[arg(long, value_parser = parse_duration)]
    pub lease_duration: Option<Duration>,

    /// Wait for the per-table application lock
    #[arg(long, value_parser = parse_duration)]
    pub app_lock_timeout: Option<Duration>,

    /// Deliveries of a change before it is skipped
    #[arg(long)]
    pub max_attempt_count: Option<u32>,

    /// Lease renewals of one batch before its executor is cancelled
    #[arg(long)]
    pub max_lease_renewal_count: Option<u32>,

    /// Custom leases table name, created in the sql_trigger schema
    #[arg(long)]
    pub leases_table_name: Option<String>,
}

impl TriggerArgs {
    /// Id shared by every worker of this function on this host.
    pub fn user_function_id(&self) -> String {
        trigger_core::user_function_id(&self.host_id, &self.function_name)
    }

    /// Apply the flags over the defaults and validate the result.
    pub fn to_options(&self) -> Result<TriggerOptions, ConfigurationError> {
        let mut options = TriggerOptions::default();

        match (self.max_batch_size, self.batch_size) {
            (Some(size), _) => options.max_batch_size = size,
            (None, Some(size)) => {
                tracing::warn!(
                    "Setting '{BATCH_SIZE_SETTING}' is deprecated, use '{MAX_BATCH_SIZE_SETTING}'"
                );
                options.max_batch_size = size;
            }
            (None, None) => {}
        }
        if let Some(interval) = self.polling_interval {
            options.polling_interval = interval;
        }
        if let Some(count) = self.max_changes_per_worker {
            options.max_changes_per_worker = count;
        }
        if let Some(duration) = self.lease_duration {
            options.lease_duration = duration;
        }
        if let Some(timeout) = self.app_lock_timeout {
            options.app_lock_timeout = timeout;
        }
        if let Some(count) = self.max_attempt_count {
            options.max_attempt_count = count;
        }
        if let Some(count) = self.max_lease_renewal_count {
            options.max_lease_renewal_count = count;
        }
        options.leases_table_name = self.leases_table_name.clone();

        options.validate()?;
        Ok(options)
    }
}
