// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Worker pool draining the work queue into a [`Reconciler`] while this replica leads.

pub mod reconcile;
pub mod watch;

pub use reconcile::{Outcome, ReconcileContext, Reconciler};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch as state;
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::OperatorError;
use crate::leader::LeaderState;
use crate::queue::{QueueItem, WorkQueue};
use crate::types::ResourceKey;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub workers: usize,
    pub reconcile_timeout: Duration,
    /// Failed attempts after which a key is given up on until its next event; 0 retries forever
    pub max_attempts: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            reconcile_timeout: Duration::from_secs(5400),
            max_attempts: 15,
        }
    }
}

pub struct Controller<R> {
    reconciler: Arc<R>,
    queue: WorkQueue<ResourceKey>,
    leadership: state::Receiver<LeaderState>,
    config: ControllerConfig,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(
        reconciler: R,
        queue: WorkQueue<ResourceKey>,
        leadership: state::Receiver<LeaderState>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            queue,
            leadership,
            config,
        }
    }

    /// Run the workers until `shutdown` fires.
    ///
    /// On shutdown the queue stops handing out keys; reconciles already running are left to
    /// finish or hit their deadline before this returns.
    pub async fn run(self, shutdown: CancellationToken) {
        let workers = self.config.workers.max(1);
        info!(workers, "Starting controller");

        let mut tasks = JoinSet::new();
        for id in 0..workers {
            let worker = Worker {
                id,
                reconciler: self.reconciler.clone(),
                queue: self.queue.clone(),
                leadership: self.leadership.clone(),
                config: self.config.clone(),
            };
            tasks.spawn(worker.run(shutdown.clone()));
        }

        shutdown.cancelled().await;
        info!("Stopping controller, waiting for in-flight reconciles");
        self.queue.shut_down().await;

        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!("Controller worker panicked: {}", e);
            }
        }
        info!("Controller stopped");
    }
}

struct Worker<R> {
    id: usize,
    reconciler: Arc<R>,
    queue: WorkQueue<ResourceKey>,
    leadership: state::Receiver<LeaderState>,
    config: ControllerConfig,
}

impl<R: Reconciler> Worker<R> {
    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            if !wait_for_leadership(&mut self.leadership, &shutdown).await {
                break;
            }
            let Some(item) = self.queue.get().await else {
                break;
            };

            if *self.leadership.borrow() != LeaderState::Leading {
                // Lost leadership while waiting for work; hand the key back untouched
                self.queue.add(item.key.clone()).await;
                self.queue.done(&item.key).await;
                continue;
            }

            self.process(item).await;
        }
        debug!(worker = self.id, "Worker stopped");
    }

    #[instrument(skip(self, item), fields(worker = self.id, key = %item.key, attempt = item.requeues))]
    async fn process(&mut self, item: QueueItem<ResourceKey>) {
        let key = item.key;
        let ctx = ReconcileContext::new(self.config.reconcile_timeout, item.requeues);
        let cancel = ctx.cancel.clone();

        let result = tokio::select! {
            res = time::timeout_at(ctx.deadline, self.reconciler.reconcile(&key, &ctx)) => Some(res),
            _ = leadership_lost(&mut self.leadership) => None,
        };

        match result {
            None => {
                cancel.cancel();
                info!("Leadership lost, cancelled in-flight reconcile");
                self.queue.add(key.clone()).await;
            }
            Some(Ok(Ok(outcome))) => self.handle_outcome(&key, outcome).await,
            Some(Ok(Err(e))) => self.handle_failure(&key, e).await,
            Some(Err(_)) => {
                cancel.cancel();
                let err = OperatorError::ReconcileTimeout {
                    key: key.to_string(),
                    timeout: self.config.reconcile_timeout,
                };
                self.handle_failure(&key, err).await;
            }
        }

        self.queue.done(&key).await;
    }

    async fn handle_outcome(&self, key: &ResourceKey, outcome: Outcome) {
        match outcome {
            Outcome {
                requeue_after: Some(delay),
                ..
            } => {
                debug!(?delay, "Reconciled, requeueing after delay");
                self.queue.forget(key).await;
                self.queue.add_after(key.clone(), delay).await;
            }
            Outcome { requeue: true, .. } => {
                let delay = self.queue.add_rate_limited(key.clone()).await;
                debug!(?delay, "Reconciled, requeueing with backoff");
            }
            Outcome { .. } => {
                debug!("Reconciled");
                self.queue.forget(key).await;
            }
        }
    }

    async fn handle_failure(&self, key: &ResourceKey, err: OperatorError) {
        let attempts = self.queue.num_requeues(key).await;
        if self.config.max_attempts > 0 && attempts >= self.config.max_attempts {
            error!(
                attempts,
                "Giving up on {} after repeated failures: {}", key, err
            );
            self.queue.forget(key).await;
            return;
        }

        let delay = self.queue.add_rate_limited(key.clone()).await;
        warn!(
            transient = err.is_transient(),
            ?delay,
            "Reconcile of {} failed, retrying: {}",
            key,
            err
        );
    }
}

/// Wait until this replica leads. Returns false when `shutdown` fires first.
async fn wait_for_leadership(
    leadership: &mut state::Receiver<LeaderState>,
    shutdown: &CancellationToken,
) -> bool {
    loop {
        if *leadership.borrow_and_update() == LeaderState::Leading {
            return true;
        }
        tokio::select! {
            _ = shutdown.cancelled() => return false,
            changed = leadership.changed() => {
                if changed.is_err() {
                    shutdown.cancelled().await;
                    return false;
                }
            }
        }
    }
}

/// Resolves once leadership is lost; never resolves if the state can no longer change
async fn leadership_lost(leadership: &mut state::Receiver<LeaderState>) {
    loop {
        if *leadership.borrow_and_update() == LeaderState::Standby {
            return;
        }
        if leadership.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::queue::ExponentialBackoff;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Done,
        Fail,
        Hang,
        Slow(Duration),
        RequeueAfter(Duration),
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Clone)]
    struct Scripted {
        steps: Arc<Mutex<VecDeque<Step>>>,
        fallback: Step,
        calls: Arc<Mutex<Vec<Instant>>>,
        dropped: Arc<AtomicBool>,
        completed: Arc<AtomicBool>,
    }

    impl Scripted {
        fn new(steps: Vec<Step>, fallback: Step) -> Self {
            Self {
                steps: Arc::new(Mutex::new(steps.into())),
                fallback,
                calls: Arc::new(Mutex::new(Vec::new())),
                dropped: Arc::new(AtomicBool::new(false)),
                completed: Arc::new(AtomicBool::new(false)),
            }
        }

        fn calls(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Reconciler for Scripted {
        async fn reconcile(&self, _key: &ResourceKey, _ctx: &ReconcileContext) -> Result<Outcome> {
            self.calls.lock().unwrap().push(Instant::now());
            let step = self.steps.lock().unwrap().pop_front().unwrap_or(self.fallback);
            match step {
                Step::Done => Ok(Outcome::done()),
                Step::Fail => Err(OperatorError::ReconcileError("boom".to_string())),
                Step::Hang => {
                    let _guard = DropFlag(self.dropped.clone());
                    std::future::pending::<()>().await;
                    Ok(Outcome::done())
                }
                Step::Slow(d) => {
                    time::sleep(d).await;
                    self.completed.store(true, Ordering::SeqCst);
                    Ok(Outcome::done())
                }
                Step::RequeueAfter(d) => Ok(Outcome::requeue_after(d)),
            }
        }
    }

    struct Harness {
        reconciler: Scripted,
        queue: WorkQueue<ResourceKey>,
        leadership: state::Sender<LeaderState>,
        shutdown: CancellationToken,
        handle: tokio::task::JoinHandle<()>,
    }

    fn start(reconciler: Scripted, config: ControllerConfig) -> Harness {
        let queue = WorkQueue::new(ExponentialBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(30),
        ));
        let (leadership, rx) = state::channel(LeaderState::Leading);
        let shutdown = CancellationToken::new();
        let controller = Controller::new(reconciler.clone(), queue.clone(), rx, config);
        let handle = tokio::spawn(controller.run(shutdown.clone()));

        Harness {
            reconciler,
            queue,
            leadership,
            shutdown,
            handle,
        }
    }

    fn config(timeout_secs: u64, max_attempts: u32) -> ControllerConfig {
        ControllerConfig {
            workers: 2,
            reconcile_timeout: Duration::from_secs(timeout_secs),
            max_attempts,
        }
    }

    fn key() -> ResourceKey {
        ResourceKey::new("default", "rekor")
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_reconcile_is_retried_after_backoff() {
        let h = start(Scripted::new(vec![Step::Hang], Step::Done), config(5, 15));
        let start = Instant::now();
        h.queue.add(key()).await;

        time::sleep(Duration::from_secs(60)).await;

        let calls = h.reconciler.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], start);
        // 5s deadline plus the 1s base backoff, never an immediate retry
        assert_eq!(calls[1] - calls[0], Duration::from_secs(6));
        assert!(h.reconciler.dropped.load(Ordering::SeqCst));
        assert_eq!(h.queue.num_requeues(&key()).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_back_off_then_give_up() {
        let h = start(Scripted::new(vec![], Step::Fail), config(5, 3));
        h.queue.add(key()).await;

        time::sleep(Duration::from_secs(600)).await;

        let calls = h.reconciler.calls();
        assert_eq!(calls.len(), 4);
        let gaps: Vec<_> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert_eq!(h.queue.num_requeues(&key()).await, 0);
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_backoff() {
        let h = start(
            Scripted::new(vec![Step::Fail, Step::Fail, Step::Done], Step::Done),
            config(5, 15),
        );
        h.queue.add(key()).await;

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.reconciler.calls().len(), 3);
        assert_eq!(h.queue.num_requeues(&key()).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_after_schedules_next_attempt() {
        let h = start(
            Scripted::new(vec![Step::RequeueAfter(Duration::from_secs(10))], Step::Done),
            config(5, 15),
        );
        h.queue.add(key()).await;

        time::sleep(Duration::from_secs(30)).await;

        let calls = h.reconciler.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1] - calls[0], Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leadership_loss_cancels_and_pauses_dispatch() {
        let h = start(Scripted::new(vec![Step::Hang], Step::Done), config(3600, 15));
        h.queue.add(key()).await;

        time::sleep(Duration::from_secs(1)).await;
        h.leadership.send_replace(LeaderState::Standby);
        time::sleep(Duration::from_secs(1)).await;

        assert!(h.reconciler.dropped.load(Ordering::SeqCst));
        assert_eq!(h.queue.num_requeues(&key()).await, 0);

        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.reconciler.calls().len(), 1);

        h.leadership.send_replace(LeaderState::Leading);
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.reconciler.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_dispatch_while_standby() {
        let h = start(Scripted::new(vec![], Step::Done), config(5, 15));
        h.leadership.send_replace(LeaderState::Standby);
        h.queue.add(key()).await;

        time::sleep(Duration::from_secs(30)).await;
        assert!(h.reconciler.calls().is_empty());

        h.leadership.send_replace(LeaderState::Leading);
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.reconciler.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_in_flight_reconcile() {
        let h = start(
            Scripted::new(vec![Step::Slow(Duration::from_secs(3))], Step::Done),
            config(5, 15),
        );
        h.queue.add(key()).await;

        time::sleep(Duration::from_secs(1)).await;
        h.shutdown.cancel();
        h.handle.await.unwrap();

        assert!(h.reconciler.completed.load(Ordering::SeqCst));
        assert!(h.queue.is_shutting_down().await);
    }
}
