//! Wiring of the fakes into a reconciler and queue.

use super::{FakeCluster, InMemoryStore};
use crate::client::RetryingClient;
use crate::config::OperatorConfig;
use crate::controller::{ControllerContext, Reconciler};
use crate::crd::EnvironmentKey;
use crate::queue::WorkQueue;
use crate::retry::MockClock;
use crate::runtime::WorkerPool;
use crate::store::RetryingStore;
use std::sync::Arc;

/// Reconciler over a [`FakeCluster`] and an [`InMemoryStore`].
///
/// The cluster client and the store retry without jitter on a [`MockClock`],
/// so retries complete instantly and the sleeps can be inspected.
pub struct TestHarness {
    /// Fake cluster API.
    pub cluster: FakeCluster,
    /// DevEnvironment store.
    pub store: Arc<InMemoryStore>,
    /// Virtual clock shared by the client and the status reporter.
    pub clock: Arc<MockClock>,
    /// Reconciler under test.
    pub reconciler: Reconciler,
    /// Work queue, not yet drained by anyone.
    pub queue: WorkQueue<EnvironmentKey>,
}

impl TestHarness {
    /// Harness with the default configuration.
    pub fn new() -> Self {
        Self::with_config(OperatorConfig::default())
    }

    /// Harness with a custom configuration.
    pub fn with_config(config: OperatorConfig) -> Self {
        let cluster = FakeCluster::new();
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(MockClock::default());
        let client = RetryingClient::new(
            cluster.clone(),
            config.client_retry.clone().without_jitter(),
            clock.clone(),
        );
        let retrying_store = RetryingStore::new(
            store.clone(),
            config.client_retry.clone().without_jitter(),
            clock.clone(),
        );
        let queue = WorkQueue::new(config.requeue_backoff.clone().without_jitter());
        let ctx = ControllerContext::new(
            Arc::new(client),
            Arc::new(retrying_store),
            clock.clone(),
            config,
        );

        Self {
            cluster,
            store,
            clock,
            reconciler: Reconciler::new(Arc::new(ctx)),
            queue,
        }
    }

    /// Worker pool over the harness queue.
    pub fn pool(&self) -> WorkerPool {
        WorkerPool::new(self.reconciler.clone(), self.queue.clone())
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
