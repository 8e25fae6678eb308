// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Admission webhooks: defaulting and validation capabilities and the HTTPS server serving them.

pub mod admission;
pub mod rekor;
pub mod server;

pub use admission::AdmissionPipeline;
pub use server::{load_tls_acceptor, WebhookServer};

use std::fmt;
use std::str::FromStr;

/// Fills in unset fields. Must be deterministic and must not fail.
pub trait Defaulter {
    fn set_defaults(&mut self);
}

/// Policy checks run before a write is persisted
pub trait Validator {
    fn validate_create(&self) -> Result<(), Rejection>;

    fn validate_update(&self, old: &Self) -> Result<(), Rejection>;

    fn validate_delete(&self) -> Result<(), Rejection> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    /// The object itself is malformed
    Invalid,
    /// The object is well-formed but the change is not allowed
    Forbidden,
}

impl RejectionReason {
    pub fn code(&self) -> u16 {
        match self {
            RejectionReason::Invalid => 422,
            RejectionReason::Forbidden => 403,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::Invalid => "Invalid",
            RejectionReason::Forbidden => "Forbidden",
        }
    }
}

/// A policy decision to refuse a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: RejectionReason,
    /// Path of the offending field, e.g. `spec.treeId`
    pub field: Option<String>,
    pub message: String,
}

impl Rejection {
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self {
            reason: RejectionReason::Invalid,
            field: Some(field.to_string()),
            message: message.into(),
        }
    }

    pub fn forbidden(field: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            reason: RejectionReason::Forbidden,
            field: field.map(str::to_string),
            message: message.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}: {}", field, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// What to do with a write when the webhook cannot reach a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Reject the write (fail-closed)
    Fail,
    /// Let the write through unmodified (fail-open)
    Ignore,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Fail" | "fail" => Ok(FailurePolicy::Fail),
            "Ignore" | "ignore" => Ok(FailurePolicy::Ignore),
            other => Err(format!(
                "unknown failure policy '{}', expected Fail or Ignore",
                other
            )),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Fail => write!(f, "Fail"),
            FailurePolicy::Ignore => write!(f, "Ignore"),
        }
    }
}
