mod config;
mod database;
mod incidents;
mod monitoring;
mod orchestrator;
mod pool;
mod ticketing;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use logger::LogFormat;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::incidents::{IncidentCoordinator, IncidentSettings};
use crate::monitoring::ProbeEngine;
use crate::orchestrator::MonitoringOrchestrator;

/// Branch and ATM network monitoring with automatic incident tickets
#[derive(Debug, Parser)]
#[command(name = "netwatch", version, about)]
struct Cli {
    /// Config file, defaults to $NETWATCH_CONFIG or ~/.config/netwatch/config.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use the short test-mode timers
    #[arg(long, global = true)]
    test_mode: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the monitoring loops until interrupted
    Start,
    /// Print the service status as JSON
    Status,
    /// Print the effective configuration
    Config,
    /// Probe the first entity of each class once
    Test,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(error) = run(cli).await {
        error!("{error:#}");
        eprintln!("netwatch: {error:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let _ = dotenvy::dotenv();

    let mut config = Config::from_config(cli.config.as_ref()).context("Failed to load configuration")?;
    config.test_mode |= cli.test_mode;
    let config = config.with_test_mode_overrides();

    let level = LevelFilter::from_str(&config.logging.level).unwrap_or(LevelFilter::INFO);
    logger::init_with(level, LogFormat::from_name(&config.logging.format));

    if config.test_mode {
        warn!("Test mode enabled, timers are shortened");
    }

    if let Command::Config = cli.command {
        print!("{config}");
        return Ok(());
    }

    let orchestrator = Arc::new(build(config).await?);
    orchestrator.initialize().await?;

    match cli.command {
        Command::Start => {
            orchestrator.start();
            wait_for_shutdown().await;
            orchestrator.shutdown().await;
        }
        Command::Status => {
            let status = orchestrator.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            orchestrator.shutdown().await;
        }
        Command::Test => {
            let checks = orchestrator.run_test_cycle().await;
            println!("{}", serde_json::to_string_pretty(&checks)?);
            orchestrator.shutdown().await;
        }
        Command::Config => {}
    }

    Ok(())
}

async fn build(config: Config) -> Result<MonitoringOrchestrator> {
    let database = database::open(&config.database).await?;
    let tickets = ticketing::from_config(&config.ticketing, database.pool().clone())?;
    let database: Arc<dyn database::Database> = Arc::new(database);

    let coordinator = IncidentCoordinator::new(Arc::clone(&database), tickets, IncidentSettings::from_config(&config));
    let engine = ProbeEngine::from_config(&config);

    info!(backend = %config.ticketing.backend, "Ticket service ready");
    Ok(MonitoringOrchestrator::new(config, database, coordinator, engine))
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl+C received, shutting down"),
        _ = terminate.recv() => info!("SIGTERM received, shutting down"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Ctrl+C received, shutting down");
}
