//! kubescaled — the kubescale daemon.
//!
//! Drives the scale-up orchestrator against an in-memory cluster loaded
//! from a TOML fixture. Each iteration prints a JSON report on stdout;
//! logs go to stderr.
//!
//! # Usage
//!
//! ```text
//! kubescaled run --cluster cluster.toml --config autoscaler.toml --iterations 3
//! kubescaled check-config --config autoscaler.toml
//! ```

mod daemon;
mod fixture;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kubescale_core::AutoscalingOptions;
use tokio::sync::watch;
use tracing::info;

use crate::daemon::Daemon;
use crate::fixture::ClusterFixture;

#[derive(Parser)]
#[command(name = "kubescaled", about = "kubescale cluster autoscaler daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the reconciliation loop.
    Run {
        /// Autoscaler options; defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Cluster fixture: node groups and pending pods.
        #[arg(long)]
        cluster: PathBuf,

        /// Stop after this many iterations.
        #[arg(long)]
        iterations: Option<usize>,

        /// Seconds between iterations.
        #[arg(long, default_value = "10")]
        interval_secs: u64,
    },
    /// Validate an options file and print the effective options.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,kubescale=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Command::Run {
            config,
            cluster,
            iterations,
            interval_secs,
        } => run(config, cluster, iterations, Duration::from_secs(interval_secs)).await,
        Command::CheckConfig { config } => {
            let options = AutoscalingOptions::from_file(&config)?;
            println!("{}", serde_json::to_string_pretty(&options)?);
            Ok(())
        }
    }
}

async fn run(
    config: Option<PathBuf>,
    cluster: PathBuf,
    iterations: Option<usize>,
    interval: Duration,
) -> anyhow::Result<()> {
    let options = match config {
        Some(path) => AutoscalingOptions::from_file(&path)?,
        None => AutoscalingOptions::default(),
    };
    let fixture = ClusterFixture::from_file(&cluster)?;
    let cluster = fixture.build(options.resource_limits.as_ref());
    let mut daemon = Daemon::new(options, cluster)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    daemon.run(iterations, interval, shutdown_rx).await?;
    eprintln!("{}", daemon.render_metrics());
    Ok(())
}
