//! stasis operator - crash-consistent virtual machine snapshots

use clap::Parser;
use kube::{Client, CustomResourceExt};

use stasis_common::crd::{VirtualMachineSnapshot, VirtualMachineSnapshotContent};
use stasis_common::telemetry::{init_telemetry, TelemetryConfig};
use stasis_operator::config::{Cli, Commands, ControllerConfig};
use stasis_operator::controller_runner::{build_cache, build_controllers};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        for crd in [VirtualMachineSnapshot::crd(), VirtualMachineSnapshotContent::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.config).await,
    }
}

async fn run_controller(config: ControllerConfig) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    tracing::info!(
        namespace = config.watch_namespace().unwrap_or("<all>"),
        watch_timeout_secs = config.watch_timeout_secs,
        controller_name = %config.controller_name,
        "Starting stasis controllers"
    );

    let (cache, reflectors) = build_cache(&client, &config);
    let reflectors: Vec<_> = reflectors.into_iter().map(tokio::spawn).collect();

    tracing::info!("Waiting for cache to sync");
    cache
        .wait_until_ready()
        .await
        .map_err(|e| anyhow::anyhow!("Cache reflector stopped before syncing: {}", e))?;

    let controllers = build_controllers(client, &config, cache);

    tokio::select! {
        _ = futures::future::join_all(controllers) => {
            tracing::info!("Controllers completed");
        }
        _ = futures::future::join_all(reflectors) => {
            tracing::warn!("Cache reflectors stopped");
        }
    }

    tracing::info!("stasis controller shutting down");
    Ok(())
}
