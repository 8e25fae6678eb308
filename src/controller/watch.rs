// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Feeds the work queue from the watch streams, plus a periodic resync of every cached key.

use futures::{stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    runtime::{reflector, reflector::Store, watcher, WatchStreamExt},
    Api, Client, Resource, ResourceExt,
};
use kube_runtime::watcher::Config as WatcherConfig;
use std::time::Duration;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::{labels, OPERATOR_NAME};
use crate::queue::WorkQueue;
use crate::types::{Rekor, ResourceKey};

/// Key of the Rekor owning `deployment`, if any
pub fn owner_key(deployment: &Deployment) -> Option<ResourceKey> {
    let kind = Rekor::kind(&());
    let api_version = Rekor::api_version(&());
    deployment
        .owner_references()
        .iter()
        .find(|o| o.kind == kind && o.api_version == api_version)
        .map(|o| ResourceKey::new(deployment.namespace().unwrap_or_default(), o.name.clone()))
}

/// Enqueue every Rekor currently in the cache
pub async fn resync(store: &Store<Rekor>, queue: &WorkQueue<ResourceKey>) -> usize {
    let cached = store.state();
    for rekor in &cached {
        queue.add(ResourceKey::from_resource(rekor.as_ref())).await;
    }
    cached.len()
}

/// Watch Rekors and the Deployments they own until `shutdown` fires, enqueueing the key of
/// every touched Rekor.
pub async fn watch_rekors(
    client: Client,
    namespace: Option<String>,
    queue: WorkQueue<ResourceKey>,
    sync_period: Duration,
    shutdown: CancellationToken,
) {
    let (rekors, deployments): (Api<Rekor>, Api<Deployment>) = match &namespace {
        Some(ns) => (
            Api::namespaced(client.clone(), ns),
            Api::namespaced(client, ns),
        ),
        None => (Api::all(client.clone()), Api::all(client)),
    };

    let (store, writer) = reflector::store();
    let rekor_keys = reflector(writer, watcher(rekors, WatcherConfig::default()))
        .default_backoff()
        .touched_objects()
        .map(|res| res.map(|rekor| Some(ResourceKey::from_resource(&rekor))));

    let owned = WatcherConfig::default()
        .labels(&format!("{}={}", labels::MANAGED_BY, OPERATOR_NAME));
    let owner_keys = watcher(deployments, owned)
        .default_backoff()
        .touched_objects()
        .map(|res| res.map(|deployment| owner_key(&deployment)));

    let mut events = stream::select(rekor_keys.boxed(), owner_keys.boxed());
    let mut resync_timer = time::interval_at(Instant::now() + sync_period, sync_period);

    info!(namespace = namespace.as_deref().unwrap_or("<all>"), "Watching Rekor resources");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = resync_timer.tick() => {
                let count = resync(&store, &queue).await;
                debug!(count, "Resynced cached Rekors");
            }
            event = events.next() => match event {
                Some(Ok(Some(key))) => queue.add(key).await,
                Some(Ok(None)) => {}
                Some(Err(e)) => warn!("Watch error: {}", e),
                None => {
                    warn!("Watch streams ended");
                    break;
                }
            }
        }
    }

    info!("Stopped watching Rekor resources");
}
