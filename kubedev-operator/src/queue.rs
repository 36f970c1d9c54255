//! Coalescing work queue with per-key serialization.
//!
//! A key is either idle, waiting in the queue, or being processed by exactly
//! one worker. Enqueuing a waiting key only updates its reason. Enqueuing a
//! key that is being processed marks it dirty; it goes back into the queue
//! once, when the worker calls [`WorkQueue::done`].

use crate::retry::BackoffPolicy;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Why a key was enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconcileReason {
    /// First time the object was seen.
    Added,
    /// Spec generation changed.
    Modified,
    /// Object deleted or marked for deletion.
    Deleted,
    /// Periodic or relist re-enqueue, and scheduled rechecks.
    Resynced,
}

impl fmt::Display for ReconcileReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReconcileReason::Added => "added",
            ReconcileReason::Modified => "modified",
            ReconcileReason::Deleted => "deleted",
            ReconcileReason::Resynced => "resynced",
        };
        f.write_str(s)
    }
}

/// A reconciliation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request<K> {
    /// Identity to reconcile.
    pub key: K,
    /// Latest reason it was enqueued for.
    pub reason: ReconcileReason,
}

struct State<K> {
    ready: VecDeque<K>,
    waiting: HashMap<K, ReconcileReason>,
    processing: HashSet<K>,
    dirty: HashMap<K, ReconcileReason>,
    scheduled: HashMap<K, Instant>,
    failures: HashMap<K, u32>,
    shutdown: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: BackoffPolicy,
    rng: Mutex<StdRng>,
}

/// Shared handle to a work queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + fmt::Debug + 'static,
{
    /// Empty queue using `backoff` for [`WorkQueue::requeue_with_backoff`].
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    ready: VecDeque::new(),
                    waiting: HashMap::new(),
                    processing: HashSet::new(),
                    dirty: HashMap::new(),
                    scheduled: HashMap::new(),
                    failures: HashMap::new(),
                    shutdown: false,
                }),
                notify: Notify::new(),
                backoff,
                rng: Mutex::new(StdRng::from_entropy()),
            }),
        }
    }

    /// Use a fixed random source for backoff jitter.
    pub fn with_rng(self, rng: StdRng) -> Self {
        *self.inner.rng.lock() = rng;
        self
    }

    /// Add a request. Coalesces with a waiting or in-flight request for the same key.
    pub fn enqueue(&self, key: K, reason: ReconcileReason) {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return;
        }
        if state.processing.contains(&key) {
            state.dirty.insert(key, reason);
            return;
        }
        if let Some(waiting) = state.waiting.get_mut(&key) {
            *waiting = reason;
            return;
        }
        state.waiting.insert(key.clone(), reason);
        state.ready.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Add a request after `delay`. An earlier pending schedule for the key wins.
    pub fn enqueue_after(&self, key: K, reason: ReconcileReason, delay: Duration) {
        if delay.is_zero() {
            self.enqueue(key, reason);
            return;
        }

        let deadline = Instant::now() + delay;
        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return;
            }
            match state.scheduled.get(&key) {
                Some(existing) if *existing <= deadline => return,
                _ => {
                    state.scheduled.insert(key.clone(), deadline);
                }
            }
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let current = {
                let mut state = queue.inner.state.lock();
                match state.scheduled.get(&key) {
                    Some(at) if *at == deadline => {
                        state.scheduled.remove(&key);
                        true
                    }
                    _ => false,
                }
            };
            if current {
                queue.enqueue(key, reason);
            }
        });
    }

    /// Wait for the next request. Returns `None` after shutdown.
    ///
    /// The returned key is marked in flight until [`WorkQueue::done`].
    pub async fn next(&self) -> Option<Request<K>> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.shutdown {
                    return None;
                }
                if let Some(request) = Self::pop(&mut state) {
                    return Some(request);
                }
            }

            notified.await;
        }
    }

    /// Take the next request without waiting.
    pub fn try_next(&self) -> Option<Request<K>> {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return None;
        }
        Self::pop(&mut state)
    }

    fn pop(state: &mut State<K>) -> Option<Request<K>> {
        let key = state.ready.pop_front()?;
        let reason = state
            .waiting
            .remove(&key)
            .unwrap_or(ReconcileReason::Resynced);
        state.processing.insert(key.clone());
        Some(Request { key, reason })
    }

    /// Finish processing `key`. Requeues it once if it was enqueued meanwhile.
    pub fn done(&self, key: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        let Some(reason) = state.dirty.remove(key) else {
            return;
        };
        if state.shutdown || state.waiting.contains_key(key) {
            return;
        }
        state.waiting.insert(key.clone(), reason);
        state.ready.push_back(key.clone());
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Count a failure for `key` and schedule it after the backoff delay.
    pub fn requeue_with_backoff(&self, key: K, reason: ReconcileReason) -> Duration {
        let failures = {
            let mut state = self.inner.state.lock();
            let count = state.failures.entry(key.clone()).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };
        let delay = {
            let mut rng = self.inner.rng.lock();
            self.inner.backoff.delay_for(failures - 1, &mut *rng)
        };
        self.enqueue_after(key, reason, delay);
        delay
    }

    /// Reset the failure count of `key`.
    pub fn forget(&self, key: &K) {
        self.inner.state.lock().failures.remove(key);
    }

    /// Consecutive failures recorded for `key`.
    pub fn failures(&self, key: &K) -> u32 {
        self.inner
            .state
            .lock()
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Whether `key` is currently being processed.
    pub fn is_processing(&self, key: &K) -> bool {
        self.inner.state.lock().processing.contains(key)
    }

    /// Requests ready to be taken.
    pub fn len(&self) -> usize {
        self.inner.state.lock().ready.len()
    }

    /// Whether no request is ready.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out work and wake every waiting worker.
    pub fn shutdown(&self) {
        self.inner.state.lock().shutdown = true;
        self.inner.notify.notify_waiters();
    }

    /// Whether [`WorkQueue::shutdown`] was called.
    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }
}
