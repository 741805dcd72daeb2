//! Operation cache controller - provisions, caches and hands out Operations

use clap::Parser;
use kube::Client;

use opcache_common::telemetry::{init_telemetry, TelemetryConfig};
use opcache_operator::controller_runner::build_controllers;
use opcache_operator::startup::{crd_manifests, ensure_crds_installed};
use opcache_operator::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - aws-lc-rs backs every TLS connection to the API server
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crd_manifests()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())
        .map_err(|e| anyhow::anyhow!("failed to initialize telemetry: {}", e))?;

    run_controllers(cli).await
}

async fn run_controllers(cli: Cli) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;

    if cli.install_crds {
        ensure_crds_installed(&client).await?;
    }

    tracing::info!("Starting operation cache controllers");
    let controllers = build_controllers(client, &cli);
    futures::future::join_all(controllers).await;

    tracing::info!("Controllers stopped, shutting down");
    Ok(())
}
