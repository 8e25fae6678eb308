// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Resource types handled by the operator.

pub mod key;
pub mod rekor;

pub use key::ResourceKey;
pub use rekor::{Condition, Rekor, RekorPhase, RekorSpec, RekorStatus};
