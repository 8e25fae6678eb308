// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::{Context, Result};
use kube::Client;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rekor_operator::config::Config;
use rekor_operator::kubernetes::wait_for_rekor_crd;
use rekor_operator::manager::Manager;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        error!("Operator failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    info!("Starting Rekor operator");

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        "Configuration loaded: leader_elect={}, watch_namespace={}, webhook_port={}",
        config.leader_elect,
        config.watch_namespace.as_deref().unwrap_or("<all>"),
        config.webhook_port
    );

    let client = Client::try_default()
        .await
        .context("Failed to connect to the Kubernetes cluster")?;
    info!("Connected to Kubernetes cluster");

    info!("Waiting for Rekor CRD to become available...");
    wait_for_rekor_crd(&client).await?;

    let shutdown = CancellationToken::new();
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let signalled = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = terminate.recv() => info!("Received SIGTERM"),
        }
        signalled.cancel();
    });

    Manager::new(config, client)
        .run(shutdown)
        .await
        .context("Operator terminated with an error")?;

    Ok(())
}
