// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Kubernetes utilities for CRD discovery, namespace discovery, and the Lease-backed store.

pub mod crd;
pub mod lease;
pub mod namespaces;

pub use crd::wait_for_rekor_crd;
pub use lease::KubeLeaseStore;
pub use namespaces::resolve_namespace;
