//! Listener lifecycle against the in-memory store.

use serde::Deserialize;
use serde_json::{json, Value};
use sql_trigger_change_tracking::testing::MemoryTrackingStore;
use sql_trigger_change_tracking::{
    FnExecutor, ListenerState, PollState, TriggerExecutor, TriggerListener, TriggerOptions,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use trigger_core::{ConfigurationError, ManualClock, SqlChange, SqlChangeOperation, TriggerError};
use trigger_scale::TargetScalerContext;

const TABLE: &str = "dbo.Products";

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

fn store() -> Arc<MemoryTrackingStore> {
    let store = Arc::new(MemoryTrackingStore::new(Arc::new(ManualClock::default())));
    store.create_table(TABLE, &[("ProductId", "int")], &[("Name", "nvarchar(50)")]);
    store
}

fn fast_options() -> TriggerOptions {
    TriggerOptions {
        polling_interval: Duration::from_millis(10),
        app_lock_timeout: Duration::from_millis(100),
        ..Default::default()
    }
}

fn channel_executor<T: Send + 'static>() -> (
    Arc<dyn TriggerExecutor<T>>,
    mpsc::UnboundedReceiver<Vec<SqlChange<T>>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let executor = FnExecutor::new(move |changes: Vec<SqlChange<T>>, _: CancellationToken| {
        let tx = tx.clone();
        async move {
            tx.send(changes)
                .map_err(|_| anyhow::anyhow!("receiver dropped"))
        }
    });
    (Arc::new(executor), rx)
}

fn listener(
    store: Arc<MemoryTrackingStore>,
    executor: Arc<dyn TriggerExecutor<Value>>,
) -> TriggerListener<Value> {
    TriggerListener::builder()
        .connection_string("Server=memory;Database=test")
        .table_name(TABLE)
        .user_function_id("fn1")
        .executor(executor)
        .store(store)
        .options(fast_options())
        .build()
        .unwrap()
}

async fn next_delivery<T>(rx: &mut mpsc::UnboundedReceiver<Vec<SqlChange<T>>>) -> Vec<SqlChange<T>> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("executor channel closed")
}

#[tokio::test]
async fn test_build_requires_arguments() {
    let store = store();
    let (executor, _rx) = channel_executor::<Value>();

    let missing = |builder: sql_trigger_change_tracking::TriggerListenerBuilder<Value>| {
        match builder.build() {
            Err(TriggerError::MissingArgument(name)) => name,
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("build should fail"),
        }
    };

    assert_eq!(
        missing(
            TriggerListener::builder()
                .table_name(TABLE)
                .user_function_id("fn1")
                .executor(executor.clone())
                .store(store.clone())
        ),
        "connection_string"
    );
    assert_eq!(
        missing(
            TriggerListener::builder()
                .connection_string("Server=x")
                .table_name("  ")
                .user_function_id("fn1")
                .executor(executor.clone())
                .store(store.clone())
        ),
        "table_name"
    );
    assert_eq!(
        missing(
            TriggerListener::builder()
                .connection_string("Server=x")
                .table_name(TABLE)
                .executor(executor.clone())
                .store(store.clone())
        ),
        "user_function_id"
    );
    assert_eq!(
        missing(
            TriggerListener::builder()
                .connection_string("Server=x")
                .table_name(TABLE)
                .user_function_id("fn1")
                .store(store.clone())
        ),
        "executor"
    );
    assert_eq!(
        missing(
            TriggerListener::builder()
                .connection_string("Server=x")
                .table_name(TABLE)
                .user_function_id("fn1")
                .executor(executor.clone())
        ),
        "store"
    );
}

#[tokio::test]
async fn test_build_rejects_bad_configuration() {
    let store = store();
    let (executor, _rx) = channel_executor::<Value>();

    let err = TriggerListener::builder()
        .connection_string("")
        .table_name(TABLE)
        .user_function_id("fn1")
        .executor(executor.clone())
        .store(store.clone())
        .build()
        .err()
        .unwrap();
    assert!(matches!(
        err,
        TriggerError::Configuration(ConfigurationError::MissingConnectionString)
    ));

    let err = TriggerListener::builder()
        .connection_string("Server=x")
        .table_name(TABLE)
        .user_function_id("fn1")
        .executor(executor)
        .store(store)
        .options(TriggerOptions {
            max_batch_size: 0,
            ..Default::default()
        })
        .build()
        .err()
        .unwrap();
    assert!(matches!(
        err,
        TriggerError::Configuration(ConfigurationError::InvalidSetting { .. })
    ));
}

#[tokio::test]
async fn test_delivers_changes_end_to_end() {
    init_logging();
    let store = store();
    let (executor, mut rx) = channel_executor();
    let listener = listener(store.clone(), executor);

    listener.start().await.unwrap();
    assert_eq!(listener.state(), ListenerState::Running);

    store
        .insert(TABLE, json!({"ProductId": 1, "Name": "Widget"}))
        .unwrap();
    let batch = next_delivery(&mut rx).await;
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].operation, SqlChangeOperation::Insert);
    assert_eq!(batch[0].item, json!({"ProductId": 1, "Name": "Widget"}));

    store
        .delete(TABLE, trigger_core::PrimaryKey::single(1i64))
        .unwrap();
    let batch = next_delivery(&mut rx).await;
    assert_eq!(batch[0].operation, SqlChangeOperation::Delete);
    assert_eq!(batch[0].item, json!({"ProductId": 1}));

    listener.stop().await.unwrap();
}

#[tokio::test]
async fn test_typed_items() {
    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(rename_all = "PascalCase")]
    struct Product {
        product_id: i64,
        name: Option<String>,
    }

    let store = store();
    let (executor, mut rx) = channel_executor::<Product>();
    let listener = TriggerListener::builder()
        .connection_string("Server=memory")
        .table_name("Products")
        .user_function_id("typed")
        .executor(executor)
        .store(store.clone())
        .options(fast_options())
        .build()
        .unwrap();
    listener.start().await.unwrap();

    store
        .insert(TABLE, json!({"ProductId": 7, "Name": "Gear"}))
        .unwrap();
    let batch = next_delivery(&mut rx).await;
    assert_eq!(
        batch[0].item,
        Product {
            product_id: 7,
            name: Some("Gear".to_string())
        }
    );
    listener.dispose().await.unwrap();
}

#[tokio::test]
async fn test_start_twice_is_invalid() {
    let store = store();
    let (executor, _rx) = channel_executor();
    let listener = listener(store, executor);

    listener.start().await.unwrap();
    assert!(matches!(
        listener.start().await,
        Err(TriggerError::InvalidState(_))
    ));
    listener.stop().await.unwrap();
    assert!(matches!(
        listener.start().await,
        Err(TriggerError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_stop_and_dispose_are_idempotent() {
    let store = store();
    let (executor, _rx) = channel_executor();
    let listener = listener(store.clone(), executor);

    listener.start().await.unwrap();
    let mut poll_state = listener.poll_state().unwrap();

    listener.stop().await.unwrap();
    listener.stop().await.unwrap();
    listener.dispose().await.unwrap();
    listener.dispose().await.unwrap();

    assert_eq!(listener.state(), ListenerState::Stopped);
    assert_eq!(store.close_count(), 1);
    poll_state
        .wait_for(|s| *s == PollState::Stopped)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_stop_before_start_is_a_no_op() {
    let store = store();
    let (executor, _rx) = channel_executor();
    let listener = listener(store.clone(), executor);

    listener.stop().await.unwrap();
    listener.dispose().await.unwrap();
    assert_eq!(listener.state(), ListenerState::Stopped);
    assert_eq!(store.close_count(), 0);
}

#[tokio::test]
async fn test_configuration_error_prevents_start() {
    let store = store();
    store.create_table("dbo.Unkeyed", &[], &[("Name", "nvarchar(10)")]);
    let (executor, _rx) = channel_executor::<Value>();
    let listener = TriggerListener::builder()
        .connection_string("Server=memory")
        .table_name("dbo.Unkeyed")
        .user_function_id("fn1")
        .executor(executor)
        .store(store)
        .build()
        .unwrap();

    let err = listener.start().await.unwrap_err();
    assert!(err.is_fatal());
    assert!(err.to_string().contains("primary key"));
    assert_eq!(listener.state(), ListenerState::Created);
    assert!(listener.poll_state().is_none());
}

#[tokio::test]
async fn test_transient_failures_do_not_stop_polling() {
    init_logging();
    let store = store();
    store.fail_next_acquires(3);
    let (executor, mut rx) = channel_executor();
    let listener = listener(store.clone(), executor);
    listener.start().await.unwrap();

    store
        .insert(TABLE, json!({"ProductId": 5, "Name": "Bolt"}))
        .unwrap();
    let batch = next_delivery(&mut rx).await;
    assert_eq!(batch[0].item["ProductId"], json!(5));
    listener.stop().await.unwrap();
}

#[tokio::test]
async fn test_two_listeners_share_work_without_overlap() {
    let store = store();
    let (executor, mut rx) = channel_executor();
    let first = listener(store.clone(), executor.clone());
    let second = listener(store.clone(), executor);
    first.start().await.unwrap();
    second.start().await.unwrap();

    for id in 1..=20 {
        store
            .insert(TABLE, json!({"ProductId": id, "Name": "x"}))
            .unwrap();
    }

    let mut seen = Vec::new();
    while seen.len() < 20 {
        for change in next_delivery(&mut rx).await {
            seen.push(change.item["ProductId"].as_i64().unwrap());
        }
    }
    seen.sort_unstable();
    assert_eq!(seen, (1..=20).collect::<Vec<i64>>());

    first.stop().await.unwrap();
    second.stop().await.unwrap();
}

#[tokio::test]
async fn test_scale_components_from_listener() {
    let store = store();
    let (executor, _rx) = channel_executor();
    let listener = listener(store.clone(), executor);
    assert!(listener.target_scaler().is_err());
    assert!(listener.watched_table().is_none());

    // Hold the lock so nothing gets leased while the backlog is sampled.
    listener.start().await.unwrap();
    let scope = listener.scope().unwrap();
    let table = listener.watched_table().unwrap();
    assert_eq!(table.object_id, scope.table_id);
    assert_eq!(table.primary_key_names().collect::<Vec<_>>(), vec!["ProductId"]);
    let _guard = store.hold_app_lock(&scope).await;
    for id in 1..=2500 {
        store
            .insert(TABLE, json!({"ProductId": id, "Name": "x"}))
            .unwrap();
    }

    let sample = listener.scale_monitor().unwrap().get_metrics().await.unwrap();
    assert_eq!(sample.unprocessed_change_count, 2500);

    let result = listener
        .target_scaler()
        .unwrap()
        .get_scale_result(&TargetScalerContext::default())
        .await
        .unwrap();
    assert_eq!(result.target_worker_count, 3);

    drop(_guard);
    listener.stop().await.unwrap();
}
