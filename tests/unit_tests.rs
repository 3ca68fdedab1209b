use clap::Parser;
use sql_trigger::{ConnectionArgs, TriggerArgs};
use sql_trigger_change_tracking::TriggerOptions;
use std::time::Duration;
use trigger_core::ConfigurationError;

fn trigger_args() -> TriggerArgs {
    TriggerArgs {
        function_name: "orders".to_string(),
        host_id: "host-a".to_string(),
        max_batch_size: None,
        batch_size: None,
        polling_interval: None,
        max_changes_per_worker: None,
        lease_duration: None,
        app_lock_timeout: None,
        max_attempt_count: None,
        max_lease_renewal_count: None,
        leases_table_name: None,
    }
}

#[test]
fn test_connection_args_creation() {
    let args = ConnectionArgs {
        connection_string: "Server=tcp:localhost,1433;Database=shop".to_string(),
        table: "dbo.Products".to_string(),
    };

    assert_eq!(args.connection_string, "Server=tcp:localhost,1433;Database=shop");
    assert_eq!(args.table, "dbo.Products");
}

#[test]
fn test_defaults_when_no_flags() {
    let options = trigger_args().to_options().unwrap();
    let defaults = TriggerOptions::default();

    assert_eq!(options.max_batch_size, defaults.max_batch_size);
    assert_eq!(options.polling_interval, defaults.polling_interval);
    assert_eq!(options.max_changes_per_worker, defaults.max_changes_per_worker);
    assert_eq!(options.lease_duration, defaults.lease_duration);
    assert_eq!(options.leases_table_name, None);
}

#[test]
fn test_flags_override_defaults() {
    let args = TriggerArgs {
        max_batch_size: Some(25),
        polling_interval: Some(Duration::from_millis(250)),
        max_changes_per_worker: Some(500),
        lease_duration: Some(Duration::from_secs(30)),
        max_attempt_count: Some(3),
        leases_table_name: Some("OrderLeases".to_string()),
        ..trigger_args()
    };
    let options = args.to_options().unwrap();

    assert_eq!(options.max_batch_size, 25);
    assert_eq!(options.polling_interval, Duration::from_millis(250));
    assert_eq!(options.max_changes_per_worker, 500);
    assert_eq!(options.lease_duration, Duration::from_secs(30));
    assert_eq!(options.max_attempt_count, 3);
    assert_eq!(options.leases_table_name.as_deref(), Some("OrderLeases"));
}

#[test]
fn test_deprecated_batch_size() {
    let args = TriggerArgs {
        batch_size: Some(40),
        ..trigger_args()
    };
    assert_eq!(args.to_options().unwrap().max_batch_size, 40);

    let args = TriggerArgs {
        max_batch_size: Some(10),
        batch_size: Some(40),
        ..trigger_args()
    };
    assert_eq!(args.to_options().unwrap().max_batch_size, 10);
}

#[test]
fn test_invalid_values_are_rejected() {
    let args = TriggerArgs {
        max_batch_size: Some(0),
        ..trigger_args()
    };
    assert!(matches!(
        args.to_options(),
        Err(ConfigurationError::InvalidSetting { .. })
    ));

    let args = TriggerArgs {
        max_changes_per_worker: Some(u32::MAX),
        ..trigger_args()
    };
    assert!(matches!(
        args.to_options(),
        Err(ConfigurationError::InvalidSetting { .. })
    ));

    let args = TriggerArgs {
        polling_interval: Some(Duration::ZERO),
        ..trigger_args()
    };
    assert!(args.to_options().is_err());
}

#[test]
fn test_user_function_id_is_stable() {
    let a = trigger_args();
    let b = trigger_args();
    assert_eq!(a.user_function_id(), b.user_function_id());
    assert_eq!(a.user_function_id().len(), 16);

    let other = TriggerArgs {
        host_id: "host-b".to_string(),
        ..trigger_args()
    };
    assert_ne!(a.user_function_id(), other.user_function_id());
}

#[derive(Parser)]
struct TestCli {
    #[command(flatten)]
    connection: ConnectionArgs,
    #[command(flatten)]
    trigger: TriggerArgs,
}

#[test]
fn test_parse_command_line() {
    let cli = TestCli::try_parse_from([
        "sql-trigger",
        "--connection-string",
        "Server=x",
        "--table",
        "dbo.Products",
        "--max-batch-size",
        "50",
        "--polling-interval",
        "2s",
        "--lease-duration",
        "1500",
    ])
    .unwrap();

    assert_eq!(cli.connection.table, "dbo.Products");
    let options = cli.trigger.to_options().unwrap();
    assert_eq!(options.max_batch_size, 50);
    assert_eq!(options.polling_interval, Duration::from_secs(2));
    assert_eq!(options.lease_duration, Duration::from_millis(1500));
}

#[test]
fn test_parse_rejects_bad_duration() {
    let result = TestCli::try_parse_from([
        "sql-trigger",
        "--connection-string",
        "Server=x",
        "--table",
        "dbo.Products",
        "--polling-interval",
        "soon",
    ]);
    assert!(result.is_err());
}
