//! fleetd: the FleetGrid daemon.
//!
//! # Usage
//!
//! ```text
//! fleetd run --config /etc/fleetd.toml --data-dir /var/lib/fleetgrid
//! fleetd check-config --config /etc/fleetd.toml
//! ```

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fleetd::{Fleet, FleetConfig};

#[derive(Parser)]
#[command(name = "fleetd", about = "FleetGrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator, scaler and maintenance loops.
    Run {
        /// Configuration file; defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/fleetgrid")]
        data_dir: PathBuf,

        #[arg(long, value_enum, default_value_t = LogFormat::Text)]
        log_format: LogFormat,
    },
    /// Parse and validate a configuration file, then exit.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fleetd=debug,fleetgrid_coordinator=debug,fleetgrid_autoscale=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            log_format,
        } => {
            init_tracing(log_format);
            let config = match config {
                Some(path) => FleetConfig::from_file(&path)?,
                None => FleetConfig::default(),
            };
            run(config, &data_dir).await
        }
        Command::CheckConfig { config } => {
            init_tracing(LogFormat::Text);
            let parsed = FleetConfig::from_file(&config)?;
            println!("{}", serde_json::to_string_pretty(&parsed)?);
            Ok(())
        }
    }
}

async fn run(config: FleetConfig, data_dir: &Path) -> anyhow::Result<()> {
    info!("FleetGrid daemon starting");
    let fleet = Fleet::open(config, data_dir).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = fleet.spawn(&shutdown_rx);
    info!(tasks = handles.len(), "background loops started");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }
    info!("FleetGrid daemon stopped");
    Ok(())
}
