//! SQL Server backend for sql-trigger
//!
//! [`MssqlTrackingStore`] implements the engine's catalog and lease traits on
//! top of SQL Server change tracking, using `tiberius` for the TDS
//! connection. Leases, the per-scope cursor and the application lock all live
//! in the monitored database, so any number of workers can share a table.

mod client;
mod convert;
pub mod sql;
mod store;
pub mod testing;

pub use client::MssqlClient;
pub use store::MssqlTrackingStore;
