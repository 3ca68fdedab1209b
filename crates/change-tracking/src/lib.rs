//! Change tracking trigger engine for sql-trigger
//!
//! Polls a table's native change tracking, leases changed rows through the
//! database so several workers can share a table, and delivers the changes
//! at-least-once to a [`TriggerExecutor`].
//!
//! The engine is written against the [`TableCatalog`] and [`LeaseStore`]
//! traits. `sql-trigger-mssql` implements them for SQL Server and
//! [`testing::MemoryTrackingStore`] implements them in memory.

mod cache;
mod executor;
mod listener;
mod metadata;
mod metrics;
pub mod options;
mod poll;
mod processor;
mod store;
pub mod testing;

pub use cache::TableInfoCache;
pub use executor::{FnExecutor, TriggerExecutor};
pub use listener::{ListenerState, TriggerListener, TriggerListenerBuilder};
pub use metadata::resolve_table;
pub use metrics::StoreMetricsProvider;
pub use options::TriggerOptions;
pub use poll::{ChangePoller, PollState, TickOutcome};
pub use processor::{BatchProcessor, BatchReport};
pub use store::{LeaseAcquisition, LeaseStore, ReleaseOutcome, TableCatalog, TrackingStore};
