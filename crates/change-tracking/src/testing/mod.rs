//! Testing utilities for the change-tracking engine
//!
//! This module provides an in-memory change-tracking database that implements
//! the store traits with the same leasing and cursor rules as SQL Server, so
//! engine behavior can be tested deterministically.

pub mod memory;

pub use memory::{LeaseSnapshot, MemoryTrackingStore};
