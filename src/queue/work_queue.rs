// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Deduplicating, per-key serialized work queue with delayed and rate-limited adds.
//!
//! A key lives in at most one of two places: queued (waiting for a worker) or processing.
//! Adding a key that is processing only marks it dirty; `done` puts it back in the queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{self, Instant};
use tracing::trace;

use super::backoff::ExponentialBackoff;

/// A key handed to a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem<K> {
    pub key: K,
    /// Consecutive rate-limited requeues of this key so far
    pub requeues: u32,
    /// When the key became eligible for processing
    pub not_before: Instant,
}

struct State<K> {
    queue: VecDeque<K>,
    /// Keys that need processing, with the instant they became eligible
    dirty: HashMap<K, Instant>,
    processing: HashSet<K>,
    /// Delayed adds that have not fired yet
    waiting: HashMap<K, Instant>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

impl<K: Clone + Eq + Hash> State<K> {
    /// Returns true when the key was appended to the queue. Any pending delayed add for `key` is
    /// satisfied by this insert, even when the key is already dirty.
    fn insert(&mut self, key: K, eligible: Instant) -> bool {
        if self.shutting_down {
            return false;
        }
        self.waiting.remove(&key);
        if self.dirty.contains_key(&key) {
            return false;
        }
        self.dirty.insert(key.clone(), eligible);
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: ExponentialBackoff,
}

pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashMap::new(),
                    processing: HashSet::new(),
                    waiting: HashMap::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    pub async fn add(&self, key: K) {
        let mut state = self.inner.state.lock().await;
        if state.insert(key, Instant::now()) {
            self.inner.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has passed; pending delays for the same key keep the earliest
    pub async fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            return self.add(key).await;
        }

        let ready_at = Instant::now() + delay;
        {
            let mut state = self.inner.state.lock().await;
            if state.shutting_down || state.waiting.get(&key).is_some_and(|at| *at <= ready_at) {
                return;
            }
            state.waiting.insert(key.clone(), ready_at);
        }

        trace!(?key, ?delay, "Scheduled delayed add");
        let inner = self.inner.clone();
        tokio::spawn(async move {
            time::sleep_until(ready_at).await;
            let mut state = inner.state.lock().await;
            if state.waiting.get(&key) != Some(&ready_at) {
                return;
            }
            if state.insert(key, ready_at) {
                inner.notify.notify_one();
            }
        });
    }

    /// Add `key` after its next backoff delay and return that delay
    pub async fn add_rate_limited(&self, key: K) -> Duration {
        let delay = {
            let mut state = self.inner.state.lock().await;
            let attempts = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.inner.backoff.delay(*attempts);
            *attempts = attempts.saturating_add(1);
            delay
        };
        self.add_after(key, delay).await;
        delay
    }

    /// Reset the backoff of `key`
    pub async fn forget(&self, key: &K) {
        self.inner.state.lock().await.failures.remove(key);
    }

    pub async fn num_requeues(&self, key: &K) -> u32 {
        self.inner
            .state
            .lock()
            .await
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    ///
    /// The caller owns the key until it calls [`WorkQueue::done`]; no other caller receives it
    /// in the meantime.
    pub async fn get(&self) -> Option<QueueItem<K>> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock().await;
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    let not_before = state.dirty.remove(&key).unwrap_or_else(Instant::now);
                    state.processing.insert(key.clone());
                    let requeues = state.failures.get(&key).copied().unwrap_or(0);
                    return Some(QueueItem {
                        key,
                        requeues,
                        not_before,
                    });
                }
            }

            notified.await;
        }
    }

    /// Release `key`; if it was added again while processing it is queued once more
    pub async fn done(&self, key: &K) {
        let mut state = self.inner.state.lock().await;
        state.processing.remove(key);
        if !state.shutting_down && state.dirty.contains_key(key) {
            state.queue.push_back(key.clone());
            self.inner.notify.notify_one();
        }
    }

    /// Number of keys waiting for a worker
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stop handing out keys; blocked and future `get` calls return `None`
    pub async fn shut_down(&self) {
        let mut state = self.inner.state.lock().await;
        state.shutting_down = true;
        state.waiting.clear();
        self.inner.notify.notify_waiters();
    }

    pub async fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().await.shutting_down
    }
}
