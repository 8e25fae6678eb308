// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Single-writer coordination between operator replicas.

pub mod elector;
pub mod lease;

pub use elector::{LeaderElectionConfig, LeaderElector, LeaderState};
pub use lease::{LeaseRecord, LeaseStore, VersionedLease};
