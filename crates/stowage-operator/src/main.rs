//! stowage - Kubernetes backup operator

use clap::{ArgAction, Parser, Subcommand};
use kube::Client;

use stowage_common::telemetry::{init_telemetry, TelemetryConfig};
use stowage_operator::controller_runner::build_controllers;
use stowage_operator::crds::{ensure_crds_installed, render_crds};

/// stowage - scheduled, streamed backups of workloads into object storage
#[derive(Parser, Debug)]
#[command(name = "stowage", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Concurrent reconciles per resource kind
    #[arg(long, env = "STOWAGE_CONCURRENCY", default_value_t = 10, global = true)]
    concurrency: u16,

    /// Apply the CRDs on startup
    #[arg(
        long,
        env = "STOWAGE_INSTALL_CRDS",
        default_value_t = true,
        action = ArgAction::Set,
        global = true
    )]
    install_crds: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the BackupStorage, BackupSchedule and BackupRun controllers (default mode)
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        println!("{}", render_crds()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "stowage-operator".to_string(),
        ..Default::default()
    })?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(&cli).await,
    }
}

async fn run_controller(cli: &Cli) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kube client: {}", e))?;

    if cli.install_crds {
        ensure_crds_installed(&client).await?;
    }

    tracing::info!(concurrency = cli.concurrency, "Starting stowage controllers");
    futures::future::join_all(build_controllers(client, cli.concurrency)).await;
    tracing::info!("Controllers stopped");
    Ok(())
}
