// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use kube::CustomResource;
use serde::{Deserialize, Serialize};

use crate::constants::defaults;

/// Desired state of a Rekor transparency log server
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[kube(group = "operator.rekor.dev", version = "v1alpha1", kind = "Rekor")]
#[kube(namespaced)]
#[kube(status = "RekorStatus")]
#[kube(shortname = "rekor")]
#[serde(rename_all = "camelCase")]
pub struct RekorSpec {
    /// rekor-server image tag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// rekor-server image repository
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    /// Trillian log tree backing this server; immutable once set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tree_id: Option<i64>,
}

impl Rekor {
    pub fn image_tag(&self) -> &str {
        self.spec.version.as_deref().unwrap_or(defaults::VERSION)
    }

    pub fn image_repository(&self) -> &str {
        self.spec.image.as_deref().unwrap_or(defaults::IMAGE)
    }

    /// Fully qualified container image reference
    pub fn image(&self) -> String {
        format!("{}:{}", self.image_repository(), self.image_tag())
    }

    pub fn replicas(&self) -> i32 {
        self.spec.replicas.unwrap_or(defaults::REPLICAS)
    }

    pub fn port(&self) -> i32 {
        self.spec.port.unwrap_or(defaults::PORT)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RekorStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<RekorPhase>,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl RekorStatus {
    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, schemars::JsonSchema)]
pub enum RekorPhase {
    Pending,
    Progressing,
    Ready,
    Failed,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    pub fn new(condition_type: &str, ok: bool, reason: &str, message: impl Into<String>) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status: if ok { "True" } else { "False" }.to_string(),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}
