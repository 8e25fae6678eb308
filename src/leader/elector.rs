// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Lease-based leader election with a two-state (`Leading` / `Standby`) machine.
//!
//! Expiry of a lease held by someone else is judged against the local instant at which this
//! replica last saw the record change, never against timestamps written by other replicas, so
//! clock skew between replicas cannot shorten a lease.

use chrono::Utc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::lease::{LeaseRecord, LeaseStore, VersionedLease};
use crate::error::{OperatorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    Leading,
    Standby,
}

#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    pub identity: String,
    /// How long a lease stays valid after its last renewal
    pub lease_duration: Duration,
    /// How long a leader keeps retrying a failing renewal before stepping down
    pub renew_deadline: Duration,
    /// Interval between election rounds
    pub retry_period: Duration,
}

impl LeaderElectionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.identity.is_empty() {
            return Err(OperatorError::ConfigError(
                "leader election identity must not be empty".to_string(),
            ));
        }
        if self.lease_duration.as_secs() == 0 {
            return Err(OperatorError::ConfigError(
                "lease duration must be at least one second".to_string(),
            ));
        }
        if self.retry_period.is_zero()
            || self.renew_deadline >= self.lease_duration
            || self.retry_period >= self.renew_deadline
        {
            return Err(OperatorError::ConfigError(format!(
                "leader election requires 0 < retry period ({:?}) < renew deadline ({:?}) < lease duration ({:?})",
                self.retry_period, self.renew_deadline, self.lease_duration
            )));
        }
        Ok(())
    }
}

type Callback = Box<dyn Fn() + Send + Sync>;

struct Observed {
    lease: VersionedLease,
    at: Instant,
}

#[derive(Default)]
struct ElectionState {
    observed: Option<Observed>,
    last_renew: Option<Instant>,
}

impl ElectionState {
    /// Remember the lease, restarting its local expiry clock only when it actually changed
    fn observe(&mut self, lease: VersionedLease, now: Instant) {
        let unchanged = self
            .observed
            .as_ref()
            .is_some_and(|o| o.lease == lease);
        if !unchanged {
            self.observed = Some(Observed { lease, at: now });
        }
    }

    fn observed_expired(&self, now: Instant) -> bool {
        match &self.observed {
            Some(o) => {
                let ttl = Duration::from_secs(o.lease.record.lease_duration_seconds.max(0) as u64);
                o.at + ttl <= now
            }
            None => true,
        }
    }
}

pub struct LeaderElector<S> {
    store: S,
    config: LeaderElectionConfig,
    state: Mutex<ElectionState>,
    leader_tx: watch::Sender<LeaderState>,
    on_started: Vec<Callback>,
    on_stopped: Vec<Callback>,
}

impl<S: LeaseStore> LeaderElector<S> {
    pub fn new(store: S, config: LeaderElectionConfig) -> Result<Self> {
        config.validate()?;
        let (leader_tx, _) = watch::channel(LeaderState::Standby);

        Ok(Self {
            store,
            config,
            state: Mutex::new(ElectionState::default()),
            leader_tx,
            on_started: Vec::new(),
            on_stopped: Vec::new(),
        })
    }

    pub fn on_started_leading(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_started.push(Box::new(callback));
        self
    }

    pub fn on_stopped_leading(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_stopped.push(Box::new(callback));
        self
    }

    /// Leadership state changes; `Standby` doubles as the leadership-lost signal
    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.leader_tx.subscribe()
    }

    pub fn state(&self) -> LeaderState {
        *self.leader_tx.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.state() == LeaderState::Leading
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// Run election rounds every retry period until `shutdown` fires.
    ///
    /// Does not release the lease; callers release it once the work it protects has stopped.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(identity = %self.config.identity, "Starting leader election");

        let mut ticker = time::interval(self.config.retry_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let renew_deadline = self.leading_deadline().await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.try_acquire_or_renew().await;
                }
                _ = sleep_until_opt(renew_deadline) => {
                    warn!(
                        "Renew deadline of {:?} elapsed without a successful renewal",
                        self.config.renew_deadline
                    );
                    self.step_down().await;
                }
            }
        }

        debug!("Leader election loop stopped");
    }

    /// One election round.
    ///
    /// A standby replica becomes leader only by writing the lease with its own identity. A
    /// leader that cannot renew keeps leading only until `renew_deadline` after its last
    /// successful renewal, which is still inside the lease it wrote; store errors never make a
    /// standby replica believe it leads.
    #[instrument(skip(self), fields(identity = %self.config.identity))]
    pub async fn try_acquire_or_renew(&self) -> LeaderState {
        if !self.is_leader() {
            match self.acquire_or_renew().await {
                Ok(true) => self.become_leader(),
                Ok(false) => debug!("Lease is held by another replica"),
                Err(e) => warn!("Failed to acquire lease: {}", e),
            }
            return self.state();
        }

        let deadline = self.renew_deadline_at().await;
        if Instant::now() >= deadline {
            warn!(
                "Renew deadline of {:?} elapsed without a successful renewal",
                self.config.renew_deadline
            );
            self.step_down().await;
            return self.state();
        }
        match time::timeout_at(deadline, self.acquire_or_renew()).await {
            Ok(Ok(true)) => debug!("Renewed lease"),
            Ok(Ok(false)) => {
                warn!("Lease was taken over by another replica");
                self.step_down().await;
            }
            Ok(Err(e)) if Instant::now() < deadline => {
                warn!("Failed to renew lease, retrying: {}", e);
            }
            Ok(Err(e)) => {
                warn!("Failed to renew lease before the renew deadline: {}", e);
                self.step_down().await;
            }
            Err(_) => {
                warn!(
                    "Renew deadline of {:?} elapsed without a successful renewal",
                    self.config.renew_deadline
                );
                self.step_down().await;
            }
        }

        self.state()
    }

    /// Give the lease up so a successor can take over without waiting for it to expire
    #[instrument(skip(self), fields(identity = %self.config.identity))]
    pub async fn release(&self) {
        if !self.is_leader() {
            return;
        }

        {
            let mut state = self.state.lock().await;
            let held = state
                .observed
                .as_ref()
                .filter(|o| o.lease.record.is_held_by(&self.config.identity))
                .map(|o| o.lease.clone());

            if let Some(current) = held {
                let released = LeaseRecord {
                    holder_identity: None,
                    lease_duration_seconds: 1,
                    renew_time: Some(Utc::now()),
                    ..current.record.clone()
                };
                match self.store.update(&released, &current.version).await {
                    Ok(lease) => {
                        state.observe(lease, Instant::now());
                        info!("Released leader lease");
                    }
                    Err(e) => warn!("Failed to release leader lease: {}", e),
                }
            }
        }

        self.step_down().await;
    }

    async fn acquire_or_renew(&self) -> Result<bool> {
        let wall = Utc::now();
        let existing = self.store.get().await?;
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let Some(current) = existing else {
            let record = LeaseRecord {
                holder_identity: Some(self.config.identity.clone()),
                lease_duration_seconds: self.lease_duration_seconds(),
                acquire_time: Some(wall),
                renew_time: Some(wall),
                leader_transitions: 0,
            };
            return match self.store.create(&record).await {
                Ok(lease) => {
                    state.observe(lease, now);
                    state.last_renew = Some(now);
                    Ok(true)
                }
                Err(OperatorError::LeaseConflict(_)) => Ok(false),
                Err(e) => Err(e),
            };
        };

        state.observe(current.clone(), now);

        let held_by_me = current.record.is_held_by(&self.config.identity);
        if !held_by_me && current.record.has_holder() && !state.observed_expired(now) {
            return Ok(false);
        }

        let record = if held_by_me {
            LeaseRecord {
                lease_duration_seconds: self.lease_duration_seconds(),
                renew_time: Some(wall),
                ..current.record.clone()
            }
        } else {
            info!(
                previous = ?current.record.holder_identity,
                "Taking over lease"
            );
            LeaseRecord {
                holder_identity: Some(self.config.identity.clone()),
                lease_duration_seconds: self.lease_duration_seconds(),
                acquire_time: Some(wall),
                renew_time: Some(wall),
                leader_transitions: current.record.leader_transitions + 1,
            }
        };

        match self.store.update(&record, &current.version).await {
            Ok(lease) => {
                state.observe(lease, now);
                state.last_renew = Some(now);
                Ok(true)
            }
            Err(OperatorError::LeaseConflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn renew_deadline_at(&self) -> Instant {
        let last_renew = self
            .state
            .lock()
            .await
            .last_renew
            .unwrap_or_else(Instant::now);
        last_renew + self.config.renew_deadline
    }

    /// Instant at which a leader must step down unless it renews first
    async fn leading_deadline(&self) -> Option<Instant> {
        if !self.is_leader() {
            return None;
        }
        Some(self.renew_deadline_at().await)
    }

    fn lease_duration_seconds(&self) -> i32 {
        i32::try_from(self.config.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }

    fn become_leader(&self) {
        if self.leader_tx.send_replace(LeaderState::Leading) == LeaderState::Standby {
            info!(identity = %self.config.identity, "Became leader");
            for callback in &self.on_started {
                callback();
            }
        }
    }

    async fn step_down(&self) {
        self.state.lock().await.last_renew = None;
        if self.leader_tx.send_replace(LeaderState::Standby) == LeaderState::Leading {
            warn!(identity = %self.config.identity, "Lost leadership");
            for callback in &self.on_stopped {
                callback();
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
