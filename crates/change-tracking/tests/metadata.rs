//! Table metadata resolution against the in-memory catalog.

use sql_trigger_change_tracking::resolve_table;
use sql_trigger_change_tracking::testing::MemoryTrackingStore;
use std::sync::Arc;
use trigger_core::{ConfigurationError, ManualClock, SqlObject, TriggerError};

fn store() -> MemoryTrackingStore {
    MemoryTrackingStore::new(Arc::new(ManualClock::default()))
}

async fn resolve_err(store: &MemoryTrackingStore, name: &str) -> ConfigurationError {
    match resolve_table(store, &SqlObject::parse(name).unwrap()).await {
        Err(TriggerError::Configuration(e)) => e,
        other => panic!("expected a configuration error for {name}, got {other:?}"),
    }
}

#[tokio::test]
async fn test_resolves_valid_table() {
    let store = store();
    let id = store.create_table(
        "sales.Orders",
        &[("Region", "nvarchar(10)"), ("OrderId", "int")],
        &[("Total", "decimal(10,2)"), ("Notes", "nvarchar(max)")],
    );

    let table = resolve_table(&store, &SqlObject::parse("[sales].[orders]").unwrap())
        .await
        .unwrap();
    assert_eq!(table.object_id, id);
    let keys: Vec<&str> = table.primary_key_names().collect();
    assert_eq!(keys, vec!["Region", "OrderId"]);
    assert_eq!(table.columns.len(), 4);
}

#[tokio::test]
async fn test_missing_table() {
    let err = resolve_err(&store(), "dbo.Nope").await;
    assert_eq!(
        err,
        ConfigurationError::TableNotFound {
            table: "dbo.Nope".to_string()
        }
    );
}

#[tokio::test]
async fn test_change_tracking_disabled() {
    let store = store();
    store.create_table("dbo.Products", &[("Id", "int")], &[]);
    store.set_change_tracking("dbo.Products", false).unwrap();
    assert!(matches!(
        resolve_err(&store, "dbo.Products").await,
        ConfigurationError::ChangeTrackingDisabled { .. }
    ));
}

#[tokio::test]
async fn test_distinct_errors_for_each_precondition() {
    let store = store();
    store.create_table("dbo.NoKey", &[], &[("Name", "nvarchar(10)")]);
    store.create_table("dbo.Reserved", &[("attemptcount", "int")], &[]);
    store.create_table("dbo.Docs", &[("Id", "int")], &[("Body", "xml")]);

    let no_key = resolve_err(&store, "dbo.NoKey").await;
    let reserved = resolve_err(&store, "dbo.Reserved").await;
    let unsupported = resolve_err(&store, "dbo.Docs").await;

    assert!(matches!(no_key, ConfigurationError::NoPrimaryKey { .. }));
    assert_eq!(
        reserved,
        ConfigurationError::ReservedColumnName {
            table: "dbo.Reserved".to_string(),
            column: "attemptcount".to_string(),
            reserved: "AttemptCount".to_string(),
        }
    );
    assert_eq!(
        unsupported,
        ConfigurationError::UnsupportedColumnType {
            table: "dbo.Docs".to_string(),
            column: "Body".to_string(),
            sql_type: "xml".to_string(),
        }
    );

    let messages = [no_key.to_string(), reserved.to_string(), unsupported.to_string()];
    assert!(messages[0].contains("primary key"));
    assert!(messages[1].contains("reserved"));
    assert!(messages[2].contains("unsupported type"));
}

#[tokio::test]
async fn test_first_violation_wins() {
    let store = store();
    store.create_table(
        "dbo.Everything",
        &[("ChangeVersion", "int")],
        &[("Shape", "geometry")],
    );
    assert!(matches!(
        resolve_err(&store, "dbo.Everything").await,
        ConfigurationError::ReservedColumnName { .. }
    ));

    store
        .set_change_tracking("dbo.Everything", false)
        .unwrap();
    assert!(matches!(
        resolve_err(&store, "dbo.Everything").await,
        ConfigurationError::ChangeTrackingDisabled { .. }
    ));
}
