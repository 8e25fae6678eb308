// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! The contract between the controller and the code that converges a single resource.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::ResourceKey;

/// What the controller should do with a key after a successful reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Outcome {
    pub requeue: bool,
    pub requeue_after: Option<Duration>,
}

impl Outcome {
    /// Converged; wait for the next change
    pub fn done() -> Self {
        Self::default()
    }

    /// Try again after the key's backoff delay
    pub fn requeue() -> Self {
        Self {
            requeue: true,
            requeue_after: None,
        }
    }

    /// Try again after `delay`, without counting it as a failure
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue: true,
            requeue_after: Some(delay),
        }
    }
}

/// Per-attempt context handed to [`Reconciler::reconcile`]
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    /// The attempt is abandoned at this instant
    pub deadline: Instant,
    /// Cancelled when the attempt is abandoned, either at the deadline or on leadership loss
    pub cancel: CancellationToken,
    /// Failed attempts for this key since its last success
    pub attempt: u32,
}

impl ReconcileContext {
    pub fn new(timeout: Duration, attempt: u32) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancel: CancellationToken::new(),
            attempt,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Converges one resource towards its desired state.
///
/// Implementations must be idempotent: calling `reconcile` again without an external change
/// performs no further writes.
pub trait Reconciler: Send + Sync + 'static {
    fn reconcile(
        &self,
        key: &ResourceKey,
        ctx: &ReconcileContext,
    ) -> impl Future<Output = Result<Outcome>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcomes() {
        assert!(!Outcome::done().requeue);
        assert_eq!(Outcome::requeue().requeue_after, None);
        assert_eq!(
            Outcome::requeue_after(Duration::from_secs(10)),
            Outcome {
                requeue: true,
                requeue_after: Some(Duration::from_secs(10))
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_remaining() {
        let ctx = ReconcileContext::new(Duration::from_secs(5), 0);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(ctx.remaining(), Duration::from_secs(3));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(ctx.remaining(), Duration::ZERO);
    }
}
