//! Scale handlers: backlog samples, scale votes and target worker counts.

use serde_json::json;
use sql_trigger::{ConnectionArgs, TriggerArgs};
use sql_trigger_change_tracking::StoreMetricsProvider;
use std::sync::Arc;
use std::time::Duration;
use trigger_core::SystemClock;
use trigger_scale::{
    MetricsWindow, ScaleMonitor, ScaleStatusContext, TargetScaler, TargetScalerContext,
    DEFAULT_WINDOW_CAPACITY,
};

use super::{connect_store, prepare_scope};

/// Sample the backlog `samples` times and print the vote after each sample.
pub async fn run_monitor(
    connection: ConnectionArgs,
    trigger: TriggerArgs,
    samples: usize,
    interval: Duration,
    worker_count: u32,
) -> anyhow::Result<()> {
    let options = trigger.to_options()?;
    let user_function_id = trigger.user_function_id();
    let store = connect_store(&connection, &options)?;
    let (scope, table) = prepare_scope(&store, &connection, &options, &user_function_id).await?;

    let provider = Arc::new(StoreMetricsProvider::new(
        store.clone(),
        scope,
        table.clone(),
        options.clone(),
        Arc::new(SystemClock),
    ));
    let monitor = ScaleMonitor::new(
        &user_function_id,
        &table.object.to_string(),
        options.max_changes_per_worker,
        provider,
    );

    let mut window = MetricsWindow::new(DEFAULT_WINDOW_CAPACITY.max(samples));
    for i in 0..samples {
        if i > 0 {
            tokio::time::sleep(interval).await;
        }
        let sample = monitor.get_metrics().await?;
        if !window.push(sample) {
            tracing::debug!(
                "Sample at {} is older than the newest in the window, not used for voting",
                sample.timestamp
            );
        }
        let status = monitor.get_scale_status(&ScaleStatusContext {
            worker_count,
            metrics: window.to_vec(),
        });
        println!(
            "{}",
            json!({
                "descriptor": monitor.descriptor(),
                "sample": sample,
                "worker_count": worker_count,
                "vote": status.vote,
            })
        );
    }

    store.close().await?;
    Ok(())
}

/// Print the desired worker count for the current backlog.
pub async fn run_target(
    connection: ConnectionArgs,
    trigger: TriggerArgs,
    instance_concurrency: Option<u32>,
) -> anyhow::Result<()> {
    let options = trigger.to_options()?;
    let user_function_id = trigger.user_function_id();
    let store = connect_store(&connection, &options)?;
    let (scope, table) = prepare_scope(&store, &connection, &options, &user_function_id).await?;

    let provider = Arc::new(StoreMetricsProvider::new(
        store.clone(),
        scope,
        table.clone(),
        options.clone(),
        Arc::new(SystemClock),
    ));
    let scaler = TargetScaler::new(
        &user_function_id,
        &table.object.to_string(),
        options.max_changes_per_worker,
        provider,
    );
    let result = scaler
        .get_scale_result(&TargetScalerContext {
            instance_concurrency,
        })
        .await?;
    println!(
        "{}",
        json!({
            "descriptor": scaler.descriptor(),
            "target_worker_count": result.target_worker_count,
        })
    );

    store.close().await?;
    Ok(())
}
