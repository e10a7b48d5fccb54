//! PostgreSQL backup agent
//!
//! Dumps every database on a server, archives and optionally encrypts the dumps,
//! uploads them to object storage and prunes old backups, on a cron schedule.

// pgstash/src/main.rs
mod backup;
mod config;
mod errors;
mod logger;
mod notify;
mod scheduler;
mod storage;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use backup::{Pipeline, RunOutcome};
use config::AppConfig;

#[derive(Parser, Debug)]
#[command(name = "pgstash", version)]
#[command(about = "Scheduled PostgreSQL backups to object storage")]
struct Cli {
    /// Path to config.json (default: ./config.json, then /etc/pgstash/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// Run backups on the configured cron schedule until interrupted (default)
    Schedule,
    /// Run one backup now, followed by a purge
    Backup,
    /// List stored backups, newest first
    List,
    /// Delete backups beyond the retention count
    Purge,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run_app(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // The logger may not be up yet.
            eprintln!("Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app(cli: Cli) -> Result<()> {
    dotenv::dotenv().ok();

    let app_config = AppConfig::load(cli.config.as_deref()).context("Failed to load application configuration")?;
    logger::init_logger(&app_config.logger).context("Failed to initialise logger")?;
    app_config.report_load_messages();

    let app_config = Arc::new(app_config);
    let pipeline = Arc::new(Pipeline::from_config(app_config.clone())?);
    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());

    match cli.command.unwrap_or(Commands::Schedule) {
        Commands::Schedule => {
            let schedule = scheduler::parse_schedule(&app_config.backup.cron)?;
            info!(
                cron = %app_config.backup.cron,
                instance_id = %app_config.instance_id,
                "Starting backup scheduler"
            );
            scheduler::run_scheduler(pipeline, schedule, cancel).await;
        }
        Commands::Backup => match pipeline.run(&cancel).await {
            RunOutcome::Succeeded { run, purged, .. } => {
                info!(key = ?run.key, databases = ?run.databases, purged, "Backup completed")
            }
            RunOutcome::PurgeFailed { run, key, error } => {
                warn!(key = %key, dumped = run.dumped, error = %error, "Backup completed, purge failed")
            }
            // Already logged and notified.
            RunOutcome::Failed(_) | RunOutcome::Skipped => {}
        },
        Commands::List => {
            let backups = pipeline.list().await.context("Failed to list backups")?;
            for timestamp in backups {
                println!("{}", timestamp);
            }
        }
        Commands::Purge => {
            if let Ok(purged) = pipeline.purge(&cancel).await {
                info!(purged, "Purge completed");
            }
        }
    }
    Ok(())
}

fn spawn_shutdown_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        cancel.cancel();
    });
}
