//! Per-call retry decorator.

use super::{ClusterClient, ObjectKind, ProjectedObject};
use crate::error::ClientError;
use crate::retry::{BackoffPolicy, Clock, Retrier};
use async_trait::async_trait;
use rand::rngs::StdRng;
use std::sync::Arc;

/// Wraps a [`ClusterClient`] and retries transient failures through a
/// [`Retrier`].
pub struct RetryingClient<C> {
    inner: C,
    retrier: Retrier,
}

impl<C: ClusterClient> RetryingClient<C> {
    /// Wrap `inner` with the given policy and clock.
    pub fn new(inner: C, policy: BackoffPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            retrier: Retrier::new(policy, clock),
        }
    }

    /// Use a fixed random source for jitter.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.retrier = self.retrier.with_rng(rng);
        self
    }

    /// The wrapped client.
    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: ClusterClient> ClusterClient for RetryingClient<C> {
    async fn get(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ProjectedObject>, ClientError> {
        self.retrier.run("get", || self.inner.get(kind, namespace, name))
            .await
    }

    async fn create(&self, object: &ProjectedObject) -> Result<(), ClientError> {
        self.retrier.run("create", || self.inner.create(object)).await
    }

    async fn update(&self, object: &ProjectedObject) -> Result<(), ClientError> {
        self.retrier.run("update", || self.inner.update(object)).await
    }

    async fn delete(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        self.retrier.run("delete", || self.inner.delete(kind, namespace, name))
            .await
    }

    async fn list(
        &self,
        kind: ObjectKind,
        label_selector: &str,
    ) -> Result<Vec<ProjectedObject>, ClientError> {
        self.retrier.run("list", || self.inner.list(kind, label_selector))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::MockClock;
    use crate::testing::{FakeCluster, Verb};
    use std::time::Duration;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(1),
            jitter: false,
        }
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let clock = Arc::new(MockClock::default());
        let fake = FakeCluster::new();
        fake.fail_next(
            Verb::List,
            ObjectKind::Namespace,
            ClientError::Timeout("slow".into()),
            1,
        );
        let client = RetryingClient::new(fake.clone(), policy(), clock.clone());

        let listed = client
            .list(ObjectKind::Namespace, "a=b")
            .await
            .expect("second attempt succeeds");

        assert!(listed.is_empty());
        assert_eq!(fake.count(Verb::List, ObjectKind::Namespace), 2);
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(100)]);
    }

    #[tokio::test]
    async fn retries_stop_at_the_ceiling() {
        let clock = Arc::new(MockClock::default());
        let fake = FakeCluster::new();
        fake.fail_next(
            Verb::List,
            ObjectKind::Namespace,
            ClientError::Unavailable("503".into()),
            10,
        );
        let client = RetryingClient::new(fake.clone(), policy(), clock.clone());

        let err = client
            .list(ObjectKind::Namespace, "a=b")
            .await
            .expect_err("ceiling reached");

        assert!(matches!(err, ClientError::Exhausted { attempts: 3, .. }));
        assert_eq!(fake.count(Verb::List, ObjectKind::Namespace), 3);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let clock = Arc::new(MockClock::default());
        let fake = FakeCluster::new();
        fake.fail_next(
            Verb::List,
            ObjectKind::Namespace,
            ClientError::Invalid("bad".into()),
            1,
        );
        let client = RetryingClient::new(fake.clone(), policy(), clock.clone());

        let err = client
            .list(ObjectKind::Namespace, "a=b")
            .await
            .expect_err("invalid is final");

        assert!(matches!(err, ClientError::Invalid(_)));
        assert_eq!(fake.count(Verb::List, ObjectKind::Namespace), 1);
        assert!(clock.sleeps().is_empty());
    }
}
