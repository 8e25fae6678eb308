// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Namespace discovery for the leader election Lease

use crate::constants::SERVICE_ACCOUNT_NAMESPACE_FILE;
use std::path::Path;
use tracing::{debug, warn};

const FALLBACK_NAMESPACE: &str = "default";

/// Namespace to keep the leader election Lease in: the configured one, else the namespace the
/// pod runs in, else `default`.
pub fn resolve_namespace(explicit: Option<&str>) -> String {
    resolve_namespace_from(explicit, Path::new(SERVICE_ACCOUNT_NAMESPACE_FILE))
}

fn resolve_namespace_from(explicit: Option<&str>, service_account_file: &Path) -> String {
    if let Some(ns) = explicit.map(str::trim).filter(|ns| !ns.is_empty()) {
        return ns.to_string();
    }

    match std::fs::read_to_string(service_account_file) {
        Ok(contents) if !contents.trim().is_empty() => {
            let ns = contents.trim().to_string();
            debug!("Discovered pod namespace {}", ns);
            ns
        }
        Ok(_) => {
            warn!(
                "{} is empty, using namespace {}",
                service_account_file.display(),
                FALLBACK_NAMESPACE
            );
            FALLBACK_NAMESPACE.to_string()
        }
        Err(e) => {
            warn!(
                "Cannot read {} ({}), using namespace {}",
                service_account_file.display(),
                e,
                FALLBACK_NAMESPACE
            );
            FALLBACK_NAMESPACE.to_string()
        }
    }
}
