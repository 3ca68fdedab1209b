//! Subcommand handlers.
//!
//! - `watch`: run a listener and print each change as a JSON line
//! - `scale`: sample the backlog and print scale votes and target counts

pub mod scale;
pub mod watch;

use anyhow::Context;
use sql_trigger::ConnectionArgs;
use sql_trigger_change_tracking::{resolve_table, TrackingStore, TriggerOptions};
use sql_trigger_mssql::MssqlTrackingStore;
use std::sync::Arc;
use trigger_core::{SqlObject, TriggerScope, WatchedTable};

pub(crate) fn connect_store(
    connection: &ConnectionArgs,
    options: &TriggerOptions,
) -> anyhow::Result<Arc<dyn TrackingStore>> {
    let store = MssqlTrackingStore::new(&connection.connection_string)?
        .with_init_lock_timeout(options.app_lock_timeout);
    Ok(Arc::new(store))
}

/// Resolve the table and make sure its leases table exists, without polling.
pub(crate) async fn prepare_scope(
    store: &Arc<dyn TrackingStore>,
    connection: &ConnectionArgs,
    options: &TriggerOptions,
    user_function_id: &str,
) -> anyhow::Result<(TriggerScope, Arc<WatchedTable>)> {
    let object = SqlObject::parse(&connection.table)?;
    let table = resolve_table(store.as_ref(), &object)
        .await
        .with_context(|| format!("Failed to resolve table {}", connection.table))?;

    let mut scope = TriggerScope::new(user_function_id, table.object_id);
    if let Some(name) = &options.leases_table_name {
        scope = scope.with_leases_table(name.clone());
    }
    store.initialize(&scope, &table).await?;
    Ok((scope, Arc::new(table)))
}
