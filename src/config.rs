// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::{Context, Result};
use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::OperatorError;
use crate::webhook::FailurePolicy;

/// Operator configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the metrics endpoint would bind to; metrics are not served by this process
    pub metrics_bind_address: String,
    pub health_probe_bind_address: SocketAddr,
    pub leader_elect: bool,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
    /// Only reconcile Rekors in this namespace; `None` watches all namespaces
    pub watch_namespace: Option<String>,
    /// Namespace holding the leader election Lease; `None` discovers the pod namespace
    pub leader_election_namespace: Option<String>,
    pub reconcile_timeout: Duration,
    pub sync_period: Duration,
    pub webhook_port: u16,
    pub webhook_cert_dir: PathBuf,
    pub max_concurrent_reconciles: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Consecutive failures after which a key is given up on; 0 retries forever
    pub max_reconcile_attempts: u32,
    pub mutating_failure_policy: FailurePolicy,
    pub validating_failure_policy: FailurePolicy,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup, falling back to defaults for unset keys
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Config {
            metrics_bind_address: non_empty("METRICS_BIND_ADDRESS")
                .unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            health_probe_bind_address: parse_or(&lookup, "HEALTH_PROBE_BIND_ADDRESS", || {
                SocketAddr::from(([0, 0, 0, 0], 9440))
            })?,
            leader_elect: parse_or(&lookup, "LEADER_ELECT", || false)?,
            lease_duration: secs_or(&lookup, "LEADER_ELECT_LEASE_DURATION_SECS", 15)?,
            renew_deadline: secs_or(&lookup, "LEADER_ELECT_RENEW_DEADLINE_SECS", 10)?,
            retry_period: secs_or(&lookup, "LEADER_ELECT_RETRY_PERIOD_SECS", 2)?,
            watch_namespace: non_empty("WATCH_NAMESPACE"),
            leader_election_namespace: non_empty("LEADER_ELECTION_NAMESPACE"),
            reconcile_timeout: secs_or(&lookup, "RECONCILE_TIMEOUT_SECS", 90 * 60)?,
            sync_period: secs_or(&lookup, "SYNC_PERIOD_SECS", 10 * 60)?,
            webhook_port: parse_or(&lookup, "WEBHOOK_PORT", || 9443)?,
            webhook_cert_dir: non_empty("WEBHOOK_CERT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp/k8s-webhook-server/serving-certs")),
            max_concurrent_reconciles: parse_or(&lookup, "MAX_CONCURRENT_RECONCILES", || 1)?,
            backoff_base: Duration::from_millis(parse_or(
                &lookup,
                "RECONCILE_BACKOFF_BASE_MS",
                || 500,
            )?),
            backoff_max: secs_or(&lookup, "RECONCILE_BACKOFF_MAX_SECS", 300)?,
            max_reconcile_attempts: parse_or(&lookup, "MAX_RECONCILE_ATTEMPTS", || 15)?,
            mutating_failure_policy: parse_or(&lookup, "MUTATING_FAILURE_POLICY", || {
                FailurePolicy::Fail
            })?,
            validating_failure_policy: parse_or(&lookup, "VALIDATING_FAILURE_POLICY", || {
                FailurePolicy::Fail
            })?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would make the operator unsafe or unable to make progress
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.lease_duration.is_zero() || self.renew_deadline.is_zero() || self.retry_period.is_zero()
        {
            return Err(OperatorError::ConfigError(
                "leader election durations must be greater than zero".to_string(),
            ));
        }
        if self.renew_deadline >= self.lease_duration {
            return Err(OperatorError::ConfigError(format!(
                "renew deadline ({:?}) must be shorter than the lease duration ({:?})",
                self.renew_deadline, self.lease_duration
            )));
        }
        if self.retry_period >= self.renew_deadline {
            return Err(OperatorError::ConfigError(format!(
                "retry period ({:?}) must be shorter than the renew deadline ({:?})",
                self.retry_period, self.renew_deadline
            )));
        }
        if self.reconcile_timeout.is_zero() {
            return Err(OperatorError::ConfigError(
                "reconcile timeout must be greater than zero".to_string(),
            ));
        }
        if self.sync_period.is_zero() {
            return Err(OperatorError::ConfigError(
                "sync period must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_reconciles == 0 {
            return Err(OperatorError::ConfigError(
                "at least one concurrent reconcile is required".to_string(),
            ));
        }
        if self.backoff_base.is_zero() || self.backoff_base > self.backoff_max {
            return Err(OperatorError::ConfigError(format!(
                "backoff base ({:?}) must be non-zero and not exceed the maximum ({:?})",
                self.backoff_base, self.backoff_max
            )));
        }
        Ok(())
    }

    pub fn webhook_bind_address(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.webhook_port))
    }
}

fn parse_or<T, F, D>(lookup: &F, key: &str, default: D) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
    D: FnOnce() -> T,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| anyhow::anyhow!("{}", e))
            .with_context(|| format!("{} has an invalid value '{}'", key, raw)),
        None => Ok(default()),
    }
}

fn secs_or<F>(lookup: &F, key: &str, default: u64) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, key, || default).map(Duration::from_secs)
}
