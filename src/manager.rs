// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Wires the operator components together and tears them down in order.

use kube::Client;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::constants::{LEADER_ELECTION_ID, OPERATOR_NAME};
use crate::controller::{watch::watch_rekors, Controller, ControllerConfig};
use crate::error::Result;
use crate::health::{HealthGate, HealthServer, Ping, ShutdownCheck, WebhookStarted};
use crate::kubernetes::{resolve_namespace, KubeLeaseStore};
use crate::leader::{LeaderElectionConfig, LeaderElector, LeaderState};
use crate::queue::{ExponentialBackoff, WorkQueue};
use crate::reconcilers::RekorReconciler;
use crate::types::Rekor;
use crate::webhook::{load_tls_acceptor, AdmissionPipeline, WebhookServer};

/// Identity of this replica in leader election: the pod name (or hostname) plus a random suffix
pub fn leader_identity<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let set = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let host = set("POD_NAME")
        .or_else(|| set("HOSTNAME"))
        .unwrap_or_else(|| OPERATOR_NAME.to_string());
    format!("{}_{}", host.trim(), uuid::Uuid::new_v4())
}

/// Liveness stays green while shutdown drains the controller; readiness follows the webhook
/// listener and drops once shutdown starts.
pub fn health_gate(
    webhook_started: Arc<AtomicBool>,
    shutdown: CancellationToken,
) -> Result<HealthGate> {
    let mut gate = HealthGate::new();
    gate.add_liveness("ping", Ping)?;
    gate.add_readiness("ping", Ping)?;
    gate.add_readiness("webhook", WebhookStarted(webhook_started))?;
    gate.add_readiness("shutdown", ShutdownCheck(shutdown))?;
    Ok(gate)
}

pub struct Manager {
    config: Config,
    client: Client,
}

impl Manager {
    pub fn new(config: Config, client: Client) -> Self {
        Self { config, client }
    }

    /// Run every component until `shutdown` fires, then stop them in dependency order.
    ///
    /// Startup failures (TLS material, ports, lease configuration) are returned before anything
    /// is spawned.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let config = self.config;

        let tls = load_tls_acceptor(&config.webhook_cert_dir).await?;
        let pipeline = AdmissionPipeline::<Rekor>::new(
            config.mutating_failure_policy,
            config.validating_failure_policy,
        )
        .with_defaulter()
        .with_validator();
        let webhook = WebhookServer::bind(config.webhook_bind_address(), Some(tls), pipeline).await?;
        let started = webhook.started();

        let gate = health_gate(started, shutdown.clone())?;
        let health = HealthServer::bind(config.health_probe_bind_address, gate).await?;

        let elector = if config.leader_elect {
            let namespace = resolve_namespace(config.leader_election_namespace.as_deref());
            let identity = leader_identity(|key| std::env::var(key).ok());
            info!(%identity, %namespace, lease = LEADER_ELECTION_ID, "Leader election enabled");

            let store = KubeLeaseStore::new(self.client.clone(), &namespace, LEADER_ELECTION_ID);
            let elector = LeaderElector::new(
                store,
                LeaderElectionConfig {
                    identity,
                    lease_duration: config.lease_duration,
                    renew_deadline: config.renew_deadline,
                    retry_period: config.retry_period,
                },
            )?
            .on_started_leading(|| info!("Became leader, starting reconciliation"))
            .on_stopped_leading(|| warn!("Lost leadership, pausing reconciliation"));
            Some(Arc::new(elector))
        } else {
            info!("Leader election disabled, reconciling as the only replica");
            None
        };
        // Kept alive for the whole run so the controller never sees a closed channel.
        let (_always_leading, always_leading_rx) = watch::channel(LeaderState::Leading);
        let leadership = match &elector {
            Some(elector) => elector.subscribe(),
            None => always_leading_rx,
        };

        let queue = WorkQueue::new(ExponentialBackoff::new(config.backoff_base, config.backoff_max));
        let controller = Controller::new(
            RekorReconciler::new(self.client.clone()),
            queue.clone(),
            leadership,
            ControllerConfig {
                workers: config.max_concurrent_reconciles,
                reconcile_timeout: config.reconcile_timeout,
                max_attempts: config.max_reconcile_attempts,
            },
        );

        let health_token = CancellationToken::new();
        let webhook_token = CancellationToken::new();
        let elector_token = CancellationToken::new();
        let feed_token = CancellationToken::new();

        let health_task = tokio::spawn(health.run(health_token.clone()));
        let webhook_task = tokio::spawn(webhook.run(webhook_token.clone()));
        let elector_task: Option<JoinHandle<()>> = elector.clone().map(|elector| {
            let token = elector_token.clone();
            tokio::spawn(async move { elector.run(token).await })
        });
        let watch_task = tokio::spawn(watch_rekors(
            self.client,
            config.watch_namespace.clone(),
            queue,
            config.sync_period,
            feed_token.clone(),
        ));
        let controller_task = tokio::spawn(controller.run(feed_token.clone()));

        info!("Operator started");
        shutdown.cancelled().await;
        info!("Shutdown requested, stopping components");

        webhook_token.cancel();
        join("webhook server", webhook_task).await;

        feed_token.cancel();
        join("watch feed", watch_task).await;
        join("controller", controller_task).await;

        elector_token.cancel();
        if let Some(task) = elector_task {
            join("leader election", task).await;
        }
        if let Some(elector) = &elector {
            elector.release().await;
        }

        health_token.cancel();
        join("health server", health_task).await;

        info!("Operator stopped");
        Ok(())
    }
}

async fn join(component: &str, task: JoinHandle<()>) {
    if let Err(e) = task.await {
        warn!("{} terminated abnormally: {}", component, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;

    fn identity(vars: &[(&str, &str)]) -> String {
        let vars: HashMap<&str, &str> = vars.iter().copied().collect();
        leader_identity(|key| vars.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn test_identity_prefers_pod_name() {
        let id = identity(&[("POD_NAME", "rekor-operator-7d9f"), ("HOSTNAME", "node")]);
        assert!(id.starts_with("rekor-operator-7d9f_"), "{}", id);
    }

    #[test]
    fn test_identity_falls_back_to_hostname_then_operator_name() {
        assert!(identity(&[("HOSTNAME", "node-1")]).starts_with("node-1_"));
        assert!(identity(&[]).starts_with("rekor-operator_"));
    }

    #[test]
    fn test_liveness_survives_webhook_stop_during_shutdown() {
        let started = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();
        let gate = health_gate(started.clone(), shutdown.clone()).unwrap();
        assert!(gate.is_live());
        assert!(gate.is_ready());

        shutdown.cancel();
        started.store(false, Ordering::SeqCst);

        assert!(gate.is_live());
        assert!(!gate.is_ready());
    }

    #[test]
    fn test_identities_are_unique_per_process_start() {
        assert_ne!(identity(&[("POD_NAME", "a")]), identity(&[("POD_NAME", "a")]));
    }
}
