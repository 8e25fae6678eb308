// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OperatorError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Lease store unavailable: {0}")]
    LeaseStoreError(String),

    #[error("Lease conflict: {0}")]
    LeaseConflict(String),

    #[error("Status of {0} changed since it was read")]
    StatusConflict(String),

    #[error("Reconcile of {key} exceeded its deadline of {timeout:?}")]
    ReconcileTimeout { key: String, timeout: Duration },

    #[error("Reconcile failed: {0}")]
    ReconcileError(String),

    #[error("Webhook server error: {0}")]
    WebhookError(String),

    #[error("TLS setup failed: {0}")]
    TlsError(String),
}

impl OperatorError {
    /// Errors worth retrying as-is: the store or network was flaky, or someone else wrote first.
    pub fn is_transient(&self) -> bool {
        match self {
            OperatorError::KubeError(kube::Error::Api(resp)) => {
                resp.code == 409 || resp.code == 429 || resp.code >= 500
            }
            OperatorError::KubeError(_)
            | OperatorError::IoError(_)
            | OperatorError::LeaseStoreError(_)
            | OperatorError::LeaseConflict(_)
            | OperatorError::StatusConflict(_)
            | OperatorError::ReconcileTimeout { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, OperatorError>;
