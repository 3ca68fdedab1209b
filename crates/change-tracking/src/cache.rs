//! Time-bounded cache of resolved table metadata.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;
use trigger_core::{Clock, Result, SqlObject, WatchedTable};

use crate::metadata::resolve_table;
use crate::store::TableCatalog;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    connection_hash: String,
    table: String,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    table: WatchedTable,
    resolved_at: DateTime<Utc>,
}

/// Resolved tables keyed by connection string hash and normalized table name.
///
/// Connection strings are hashed so credentials are never held as map keys.
#[derive(Debug)]
pub struct TableInfoCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    timeout: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl TableInfoCache {
    pub fn new(timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            timeout: chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX),
            clock,
        }
    }

    /// Return the cached table, resolving through `catalog` when absent or expired.
    pub async fn get_or_resolve<C>(
        &self,
        connection_string: &str,
        catalog: &C,
        object: &SqlObject,
    ) -> Result<WatchedTable>
    where
        C: TableCatalog + ?Sized,
    {
        let key = CacheKey {
            connection_hash: connection_hash(connection_string),
            table: object.normalized(),
        };

        let now = self.clock.now();
        if let Some(entry) = self.lock().get(&key) {
            if now - entry.resolved_at < self.timeout {
                debug!("Using cached metadata for table {object}");
                return Ok(entry.table.clone());
            }
            debug!("Cached metadata for table {object} expired");
        }

        let table = resolve_table(catalog, object).await?;
        self.lock().insert(
            key,
            CacheEntry {
                table: table.clone(),
                resolved_at: self.clock.now(),
            },
        );
        Ok(table)
    }

    pub fn invalidate(&self, connection_string: &str, object: &SqlObject) {
        self.lock().remove(&CacheKey {
            connection_hash: connection_hash(connection_string),
            table: object.normalized(),
        });
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn connection_hash(connection_string: &str) -> String {
    hex::encode(Sha256::digest(connection_string.as_bytes()))
}
