//! Trigger identity: user function ids and per-scope object names.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::table::bracket_quote;

/// Schema holding the trigger's bookkeeping tables.
pub const SCHEMA_NAME: &str = "sql_trigger";

/// Table holding one cursor row per trigger scope.
pub const GLOBAL_STATE_TABLE: &str = "[sql_trigger].[GlobalState]";

/// Derive a stable id for a user function.
///
/// The id is the first 16 hex characters of the SHA-256 of
/// `{host_id}-{function_name}`, so every instance of the same function on the
/// same host shares leases.
pub fn user_function_id(host_id: &str, function_name: &str) -> String {
    let digest = Sha256::digest(format!("{host_id}-{function_name}").as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// The (user function, table) pair that owns a leases table and cursor row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerScope {
    pub user_function_id: String,
    pub table_id: i32,
    pub user_defined_leases_table: Option<String>,
}

impl TriggerScope {
    pub fn new(user_function_id: impl Into<String>, table_id: i32) -> Self {
        Self {
            user_function_id: user_function_id.into(),
            table_id,
            user_defined_leases_table: None,
        }
    }

    pub fn with_leases_table(mut self, name: impl Into<String>) -> Self {
        self.user_defined_leases_table = Some(name.into());
        self
    }

    /// Bracket-quoted leases table name.
    pub fn leases_table_name(&self) -> String {
        let table = match &self.user_defined_leases_table {
            Some(name) => name.clone(),
            None => format!("Leases_{}_{}", self.user_function_id, self.table_id),
        };
        format!("{}.{}", bracket_quote(SCHEMA_NAME), bracket_quote(&table))
    }

    /// Resource name for `sp_getapplock`.
    pub fn app_lock_resource(&self) -> String {
        format!("{SCHEMA_NAME}_{}_{}", self.user_function_id, self.table_id)
    }
}
