// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Reconcilers converging custom resources towards their spec.

pub mod rekor;

pub use rekor::RekorReconciler;
