// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Rekor reconciler - converges a Rekor into a rekor-server Deployment and reports its status.

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{
    api::{ObjectMeta, Patch, PatchParams, PostParams},
    Api, Client, Resource, ResourceExt,
};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::constants::{labels, OPERATOR_NAME, PROGRESS_REQUEUE_SECS, SERVER_CONTAINER};
use crate::controller::{Outcome, ReconcileContext, Reconciler};
use crate::error::{OperatorError, Result};
use crate::types::{Condition, Rekor, RekorPhase, RekorStatus, ResourceKey};

const READY_CONDITION: &str = "Ready";

pub struct RekorReconciler {
    client: Client,
}

impl RekorReconciler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn converge(&self, rekors: &Api<Rekor>, rekor: &Rekor) -> Result<Outcome> {
        let name = rekor.name_any();
        let namespace = rekor.namespace().unwrap_or_default();
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);

        let desired = desired_deployment(rekor)?;
        let observed = match deployments.get_opt(&name).await? {
            Some(existing) if !needs_update(&desired, &existing) => {
                debug!("Deployment {}/{} is up to date", namespace, name);
                existing
            }
            existing => {
                info!(
                    "{} Deployment {}/{}",
                    if existing.is_some() { "Updating" } else { "Creating" },
                    namespace,
                    name
                );
                deployments
                    .patch(
                        &name,
                        &PatchParams::apply(OPERATOR_NAME).force(),
                        &Patch::Apply(&desired),
                    )
                    .await?
            }
        };

        let status = observed_status(rekor, &observed);
        let ready = status.phase == Some(RekorPhase::Ready);
        self.write_status_if_changed(rekors, rekor, status).await?;

        if ready {
            Ok(Outcome::done())
        } else {
            Ok(Outcome::requeue_after(Duration::from_secs(PROGRESS_REQUEUE_SECS)))
        }
    }

    /// Replace the status subresource, conditional on the resourceVersion the Rekor was read at
    async fn write_status_if_changed(
        &self,
        rekors: &Api<Rekor>,
        rekor: &Rekor,
        status: RekorStatus,
    ) -> Result<bool> {
        if rekor.status.as_ref() == Some(&status) {
            return Ok(false);
        }

        let name = rekor.name_any();
        let mut updated = rekor.clone();
        updated.status = Some(status);
        let body = serde_json::to_vec(&updated)?;

        match rekors.replace_status(&name, &PostParams::default(), body).await {
            Ok(_) => {
                debug!("Updated status of Rekor {}", name);
                Ok(true)
            }
            Err(kube::Error::Api(resp)) if resp.code == 409 => Err(OperatorError::StatusConflict(
                ResourceKey::from_resource(rekor).to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn record_failure(&self, rekors: &Api<Rekor>, rekor: &Rekor, err: &OperatorError) {
        let status = RekorStatus {
            observed_generation: rekor.metadata.generation,
            phase: Some(RekorPhase::Failed),
            ready_replicas: rekor.status.as_ref().map_or(0, |s| s.ready_replicas),
            conditions: vec![Condition::new(
                READY_CONDITION,
                false,
                "ReconcileError",
                err.to_string(),
            )],
        };
        if let Err(e) = self.write_status_if_changed(rekors, rekor, status).await {
            warn!("Failed to record reconcile error in status: {}", e);
        }
    }
}

impl Reconciler for RekorReconciler {
    #[instrument(skip(self, key, ctx), fields(key = %key, attempt = ctx.attempt))]
    async fn reconcile(&self, key: &ResourceKey, ctx: &ReconcileContext) -> Result<Outcome> {
        let rekors: Api<Rekor> = Api::namespaced(self.client.clone(), &key.namespace);

        let Some(rekor) = rekors.get_opt(&key.name).await? else {
            debug!("Rekor {} no longer exists", key);
            return Ok(Outcome::done());
        };
        if rekor.meta().deletion_timestamp.is_some() {
            debug!("Rekor {} is being deleted", key);
            return Ok(Outcome::done());
        }

        match self.converge(&rekors, &rekor).await {
            Err(e) if !e.is_transient() => {
                self.record_failure(&rekors, &rekor, &e).await;
                Err(e)
            }
            res => res,
        }
    }
}

fn selector_labels(rekor: &Rekor) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::NAME.to_string(), SERVER_CONTAINER.to_string()),
        (labels::INSTANCE.to_string(), rekor.name_any()),
    ])
}

/// The Deployment a Rekor should be running as
pub fn desired_deployment(rekor: &Rekor) -> Result<Deployment> {
    let owner = rekor.controller_owner_ref(&()).ok_or_else(|| {
        OperatorError::ReconcileError(format!(
            "Rekor {} has no uid; cannot own a Deployment",
            ResourceKey::from_resource(rekor)
        ))
    })?;

    let selector = selector_labels(rekor);
    let mut pod_labels = selector.clone();
    pod_labels.insert(labels::MANAGED_BY.to_string(), OPERATOR_NAME.to_string());

    let port = rekor.port();
    let mut args = vec![
        "serve".to_string(),
        "--rekor_server.address=0.0.0.0".to_string(),
        format!("--port={}", port),
    ];
    if let Some(tree_id) = rekor.spec.tree_id {
        args.push(format!("--trillian_log_server.tlog_id={}", tree_id));
    }

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(rekor.name_any()),
            namespace: rekor.namespace(),
            labels: Some(pod_labels.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(rekor.replicas()),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: SERVER_CONTAINER.to_string(),
                        image: Some(rekor.image()),
                        args: Some(args),
                        ports: Some(vec![ContainerPort {
                            name: Some("http".to_string()),
                            container_port: port,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

fn server_container(deployment: &Deployment) -> Option<&Container> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.iter().find(|c| c.name == SERVER_CONTAINER))
}

/// Whether `existing` drifted from `desired` in any field this operator manages
pub fn needs_update(desired: &Deployment, existing: &Deployment) -> bool {
    let replicas = |d: &Deployment| d.spec.as_ref().and_then(|s| s.replicas);
    if replicas(desired) != replicas(existing) {
        return true;
    }

    let owned_labels_missing = desired.labels().iter().any(|(k, v)| existing.labels().get(k) != Some(v));
    if owned_labels_missing {
        return true;
    }

    let ports = |c: &Container| -> Vec<i32> {
        c.ports
            .iter()
            .flatten()
            .map(|p| p.container_port)
            .collect()
    };
    match (server_container(desired), server_container(existing)) {
        (Some(want), Some(have)) => {
            want.image != have.image || want.args != have.args || ports(want) != ports(have)
        }
        _ => true,
    }
}

/// Status derived from what the Deployment reports
pub fn observed_status(rekor: &Rekor, deployment: &Deployment) -> RekorStatus {
    let desired = rekor.replicas();
    let ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);

    let (phase, reason) = if ready >= desired {
        (RekorPhase::Ready, "DeploymentReady")
    } else if deployment.status.is_none() {
        (RekorPhase::Pending, "DeploymentPending")
    } else {
        (RekorPhase::Progressing, "DeploymentProgressing")
    };

    RekorStatus {
        observed_generation: rekor.metadata.generation,
        phase: Some(phase),
        ready_replicas: ready,
        conditions: vec![Condition::new(
            READY_CONDITION,
            phase == RekorPhase::Ready,
            reason,
            format!("{}/{} replicas ready", ready, desired),
        )],
    }
}
