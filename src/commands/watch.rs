//! Watch handler: print changes as they are delivered.
//!
//! CLI command: `watch --connection-string ... --table dbo.Products [--run-for 10m]`

use serde_json::Value;
use sql_trigger::{ConnectionArgs, TriggerArgs};
use sql_trigger_change_tracking::{FnExecutor, TriggerListener};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use trigger_core::SqlChange;

use super::connect_store;

pub async fn run(
    connection: ConnectionArgs,
    trigger: TriggerArgs,
    run_for: Option<Duration>,
) -> anyhow::Result<()> {
    let options = trigger.to_options()?;
    let store = connect_store(&connection, &options)?;

    let executor = FnExecutor::new(
        |changes: Vec<SqlChange<Value>>, _cancel: CancellationToken| async move {
            for change in &changes {
                println!("{}", serde_json::to_string(change)?);
            }
            Ok::<(), anyhow::Error>(())
        },
    );

    let listener = TriggerListener::<Value>::builder()
        .connection_string(connection.connection_string.clone())
        .table_name(connection.table.clone())
        .user_function_id(trigger.user_function_id())
        .executor(Arc::new(executor))
        .store(store)
        .options(options)
        .build()?;
    listener.start().await?;

    tracing::info!("Watching {} for changes, press Ctrl-C to stop", connection.table);
    match run_for {
        Some(limit) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = tokio::time::sleep(limit) => {
                    tracing::info!("Run time of {limit:?} elapsed");
                }
            }
        }
        None => {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Failed to listen for Ctrl-C: {e}");
            }
        }
    }

    tracing::info!("Stopping listener");
    listener.stop().await?;
    Ok(())
}
