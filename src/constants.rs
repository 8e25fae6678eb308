// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

/// The operator name used for server-side apply and as the default identity prefix
pub const OPERATOR_NAME: &str = "rekor-operator";

/// Name of the Lease object shared by all operator replicas
pub const LEADER_ELECTION_ID: &str = "operator.rekor.dev";

/// Kubernetes label keys set on objects owned by a Rekor
pub mod labels {
    pub const NAME: &str = "app.kubernetes.io/name";
    pub const INSTANCE: &str = "app.kubernetes.io/instance";
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
}

/// Defaults applied to unset Rekor spec fields
pub mod defaults {
    pub const VERSION: &str = "v1";
    pub const IMAGE: &str = "gcr.io/projectsigstore/rekor-server";
    pub const REPLICAS: i32 = 1;
    pub const PORT: i32 = 3000;
}

/// Name of the rekor-server container inside the managed Deployment
pub const SERVER_CONTAINER: &str = "rekor-server";

/// How long to wait before looking at a Deployment that is still rolling out
pub const PROGRESS_REQUEUE_SECS: u64 = 10;

/// CRD polling configuration
pub mod crd {
    /// Initial polling interval in seconds when waiting for CRD
    pub const POLL_INTERVAL_SECS: u64 = 10;
    /// Maximum polling interval in seconds (exponential backoff cap)
    pub const POLL_MAX_INTERVAL_SECS: u64 = 60;
}

/// Webhook serving certificate file names inside the certificate directory
pub mod tls {
    pub const CERT_FILE: &str = "tls.crt";
    pub const KEY_FILE: &str = "tls.key";
}

/// Service account namespace file used to discover the pod namespace
pub const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";
