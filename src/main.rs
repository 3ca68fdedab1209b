//! Command-line interface for sql-trigger
//!
//! # Usage Examples
//!
//! ## Watch a table
//! ```bash
//! # Print inserts, updates and deletes on dbo.Products as JSON lines
//! export SqlConnectionString="Server=tcp:localhost,1433;Database=shop;User Id=sa;Password=...;TrustServerCertificate=true"
//! sql-trigger watch --table dbo.Products --polling-interval 500ms
//!
//! # Two workers sharing one table: same function name and host id
//! sql-trigger watch --table dbo.Products --function-name orders --host-id host-a
//! ```
//!
//! ## Scaling
//! ```bash
//! # Vote after each of 5 samples taken one second apart, assuming 2 workers
//! sql-trigger scale --table dbo.Products --samples 5 --interval 1s --worker-count 2
//!
//! # Desired worker count for the current backlog
//! sql-trigger target --table dbo.Products --instance-concurrency 500
//! ```
//!
//! ## Settings
//! - `Sql_Trigger_MaxBatchSize` (deprecated alias `Sql_Trigger_BatchSize`)
//! - `Sql_Trigger_PollingIntervalMs`
//! - `Sql_Trigger_MaxChangesPerWorker`

use clap::{Parser, Subcommand};
use sql_trigger::config::parse_duration;
use sql_trigger::{ConnectionArgs, TriggerArgs};
use std::time::Duration;
use trigger_scale::MIN_SAMPLES_FOR_SCALING;

mod commands;

#[derive(Parser)]
#[command(name = "sql-trigger")]
#[command(about = "Run SQL Server change tracking triggers from the command line")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch a table and print each change as a JSON line
    Watch {
        #[command(flatten)]
        connection: ConnectionArgs,

        #[command(flatten)]
        trigger: TriggerArgs,

        /// Stop after this long instead of waiting for Ctrl-C
        #[arg(long, value_parser = parse_duration)]
        run_for: Option<Duration>,
    },

    /// Sample the unprocessed change count and print scale votes
    Scale {
        #[command(flatten)]
        connection: ConnectionArgs,

        #[command(flatten)]
        trigger: TriggerArgs,

        /// Number of samples to take
        #[arg(long, default_value_t = MIN_SAMPLES_FOR_SCALING)]
        samples: usize,

        /// Delay between samples
        #[arg(long, default_value = "1s", value_parser = parse_duration)]
        interval: Duration,

        /// Current number of workers
        #[arg(long, default_value_t = 1)]
        worker_count: u32,
    },

    /// Print the desired worker count for the current backlog
    Target {
        #[command(flatten)]
        connection: ConnectionArgs,

        #[command(flatten)]
        trigger: TriggerArgs,

        /// Changes one instance processes concurrently (defaults to max changes per worker)
        #[arg(long)]
        instance_concurrency: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Watch {
            connection,
            trigger,
            run_for,
        } => commands::watch::run(connection, trigger, run_for).await,
        Commands::Scale {
            connection,
            trigger,
            samples,
            interval,
            worker_count,
        } => {
            commands::scale::run_monitor(connection, trigger, samples, interval, worker_count)
                .await
        }
        Commands::Target {
            connection,
            trigger,
            instance_concurrency,
        } => commands::scale::run_target(connection, trigger, instance_concurrency).await,
    }
}
