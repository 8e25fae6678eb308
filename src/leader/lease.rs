// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Lease record and the store contract the elector relies on.

use chrono::{DateTime, Utc};
use std::future::Future;

use crate::error::Result;

/// Contents of the single lease held per election group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Current holder; `None` (or empty) means the lease is free
    pub holder_identity: Option<String>,
    pub lease_duration_seconds: i32,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    pub leader_transitions: i32,
}

impl LeaseRecord {
    pub fn is_held_by(&self, identity: &str) -> bool {
        self.holder_identity.as_deref() == Some(identity)
    }

    pub fn has_holder(&self) -> bool {
        self.holder_identity.as_deref().is_some_and(|h| !h.is_empty())
    }
}

/// A lease record together with the store version it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedLease {
    pub record: LeaseRecord,
    pub version: String,
}

/// Consistent storage for one lease record with conditional writes.
///
/// `create` fails with [`crate::error::OperatorError::LeaseConflict`] when a record already
/// exists and `update` fails the same way when `version` is no longer current.
pub trait LeaseStore: Send + Sync + 'static {
    fn get(&self) -> impl Future<Output = Result<Option<VersionedLease>>> + Send;

    fn create(&self, record: &LeaseRecord) -> impl Future<Output = Result<VersionedLease>> + Send;

    fn update(
        &self,
        record: &LeaseRecord,
        version: &str,
    ) -> impl Future<Output = Result<VersionedLease>> + Send;
}
