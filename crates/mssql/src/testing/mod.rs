//! Testing utilities for the SQL Server backend
//!
//! Docker container management for integration tests.

pub mod container;

pub use container::MssqlContainer;
