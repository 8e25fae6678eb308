// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! CRD availability checking utilities

use crate::constants::crd::{POLL_INTERVAL_SECS, POLL_MAX_INTERVAL_SECS};
use crate::error::Result;
use crate::types::Rekor;
use kube::{discovery::Discovery, Client, Resource};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Wait for the Rekor CRD to be served by the API server.
/// Polls with exponential backoff starting at POLL_INTERVAL_SECS seconds.
pub async fn wait_for_rekor_crd(client: &Client) -> Result<()> {
    let group = Rekor::group(&());
    let version = Rekor::version(&());
    let mut interval = POLL_INTERVAL_SECS;

    loop {
        match check_rekor_crd_exists(client).await {
            Ok(true) => {
                info!("Rekor CRD ({}/{}) is available", group, version);
                return Ok(());
            }
            Ok(false) => {
                info!(
                    "Rekor CRD ({}/{}) not yet available, waiting {} seconds...",
                    group, version, interval
                );
            }
            Err(e) => {
                warn!(
                    "Error checking for Rekor CRD: {}, retrying in {} seconds...",
                    e, interval
                );
            }
        }

        sleep(Duration::from_secs(interval)).await;

        interval = next_interval(interval);
    }
}

fn next_interval(interval: u64) -> u64 {
    (interval * 2).min(POLL_MAX_INTERVAL_SECS)
}

async fn check_rekor_crd_exists(client: &Client) -> Result<bool> {
    let group = Rekor::group(&());
    let discovery = Discovery::new(client.clone())
        .filter(&[group.as_ref()])
        .run()
        .await?;

    let found = discovery
        .groups()
        .filter(|g| g.name() == group)
        .flat_map(|g| g.recommended_resources())
        .any(|(ar, _)| ar.kind == Rekor::kind(&()) && ar.version == Rekor::version(&()));

    Ok(found)
}
