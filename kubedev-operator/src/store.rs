//! Access to the DevEnvironment store (spec + status).

use crate::crd::{DevEnvironment, DevEnvironmentStatus, EnvironmentKey, FINALIZER};
use crate::error::ClientError;
use crate::retry::{BackoffPolicy, Clock, Retrier};
use async_trait::async_trait;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;

/// Reads and writes DevEnvironment objects.
#[async_trait]
pub trait EnvironmentStore: Send + Sync {
    /// Fetch one environment; `Ok(None)` once it is gone.
    async fn get(&self, key: &EnvironmentKey) -> Result<Option<DevEnvironment>, ClientError>;

    /// Every environment in scope.
    async fn list(&self) -> Result<Vec<DevEnvironment>, ClientError>;

    /// Replace the status subresource.
    async fn patch_status(
        &self,
        key: &EnvironmentKey,
        status: &DevEnvironmentStatus,
    ) -> Result<(), ClientError>;

    /// Merge-patch the spec.
    async fn patch_spec(
        &self,
        key: &EnvironmentKey,
        patch: serde_json::Value,
    ) -> Result<(), ClientError>;

    /// Add the teardown finalizer if it is missing.
    async fn add_finalizer(&self, key: &EnvironmentKey) -> Result<(), ClientError>;

    /// Remove the teardown finalizer, letting a deleted object go.
    async fn remove_finalizer(&self, key: &EnvironmentKey) -> Result<(), ClientError>;

    /// Request deletion. Succeeds when the object is already gone.
    async fn delete(&self, key: &EnvironmentKey) -> Result<(), ClientError>;
}

/// Status fields that are omitted when unset and must be nulled explicitly
/// for a merge patch to clear them.
const OPTIONAL_STATUS_FIELDS: [&str; 8] = [
    "message",
    "accessURL",
    "internalIP",
    "externalPort",
    "observedGeneration",
    "lastTransitionTime",
    "namespace",
    "observedRestartNonce",
];

/// Merge patch body that replaces the whole status.
pub fn status_patch(status: &DevEnvironmentStatus) -> Result<serde_json::Value, ClientError> {
    let mut value =
        serde_json::to_value(status).map_err(|e| ClientError::Invalid(e.to_string()))?;
    if let Some(fields) = value.as_object_mut() {
        for field in OPTIONAL_STATUS_FIELDS {
            fields
                .entry(field.to_string())
                .or_insert(serde_json::Value::Null);
        }
    }
    Ok(value)
}

/// [`EnvironmentStore`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeEnvironmentStore {
    client: Client,
    watch_namespace: Option<String>,
}

impl KubeEnvironmentStore {
    /// Store scoped to `watch_namespace`, or to all namespaces.
    pub fn new(client: Client, watch_namespace: Option<String>) -> Self {
        Self {
            client,
            watch_namespace,
        }
    }

    fn api(&self, key: &EnvironmentKey) -> Api<DevEnvironment> {
        Api::namespaced(self.client.clone(), &key.namespace)
    }

    /// Api handle for listing and watching.
    pub fn scoped_api(&self) -> Api<DevEnvironment> {
        match &self.watch_namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    async fn set_finalizers(
        &self,
        key: &EnvironmentKey,
        update: impl FnOnce(&mut Vec<String>) -> bool + Send,
    ) -> Result<(), ClientError> {
        let api = self.api(key);
        let Some(env) = api.get_opt(&key.name).await? else {
            return Ok(());
        };
        let mut finalizers = env.finalizers().to_vec();
        if !update(&mut finalizers) {
            return Ok(());
        }
        // resourceVersion makes a concurrent change fail with 409.
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": env.resource_version(),
            }
        });
        match api
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => match ClientError::from(err) {
                ClientError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }
}

#[async_trait]
impl EnvironmentStore for KubeEnvironmentStore {
    async fn get(&self, key: &EnvironmentKey) -> Result<Option<DevEnvironment>, ClientError> {
        Ok(self.api(key).get_opt(&key.name).await?)
    }

    async fn list(&self) -> Result<Vec<DevEnvironment>, ClientError> {
        let list = self.scoped_api().list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn patch_status(
        &self,
        key: &EnvironmentKey,
        status: &DevEnvironmentStatus,
    ) -> Result<(), ClientError> {
        let patch = serde_json::json!({
            "status": status_patch(status)?
        });
        self.api(key)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_spec(
        &self,
        key: &EnvironmentKey,
        patch: serde_json::Value,
    ) -> Result<(), ClientError> {
        let patch = serde_json::json!({ "spec": patch });
        self.api(key)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn add_finalizer(&self, key: &EnvironmentKey) -> Result<(), ClientError> {
        self.set_finalizers(key, |finalizers| {
            if finalizers.iter().any(|f| f == FINALIZER) {
                return false;
            }
            finalizers.push(FINALIZER.to_string());
            true
        })
        .await
    }

    async fn remove_finalizer(&self, key: &EnvironmentKey) -> Result<(), ClientError> {
        self.set_finalizers(key, |finalizers| {
            let before = finalizers.len();
            finalizers.retain(|f| f != FINALIZER);
            finalizers.len() != before
        })
        .await
    }

    async fn delete(&self, key: &EnvironmentKey) -> Result<(), ClientError> {
        match self.api(key).delete(&key.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(err) => match ClientError::from(err) {
                ClientError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }
}

/// Wraps an [`EnvironmentStore`] and retries transient failures, the same
/// way [`crate::client::RetryingClient`] does for cluster calls.
pub struct RetryingStore {
    inner: Arc<dyn EnvironmentStore>,
    retrier: Retrier,
}

impl RetryingStore {
    /// Wrap `inner` with the given policy and clock.
    pub fn new(
        inner: Arc<dyn EnvironmentStore>,
        policy: BackoffPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner,
            retrier: Retrier::new(policy, clock),
        }
    }
}

#[async_trait]
impl EnvironmentStore for RetryingStore {
    async fn get(&self, key: &EnvironmentKey) -> Result<Option<DevEnvironment>, ClientError> {
        self.retrier.run("get environment", || self.inner.get(key)).await
    }

    async fn list(&self) -> Result<Vec<DevEnvironment>, ClientError> {
        self.retrier.run("list environments", || self.inner.list()).await
    }

    async fn patch_status(
        &self,
        key: &EnvironmentKey,
        status: &DevEnvironmentStatus,
    ) -> Result<(), ClientError> {
        self.retrier
            .run("patch status", || self.inner.patch_status(key, status))
            .await
    }

    async fn patch_spec(
        &self,
        key: &EnvironmentKey,
        patch: serde_json::Value,
    ) -> Result<(), ClientError> {
        self.retrier
            .run("patch spec", || self.inner.patch_spec(key, patch.clone()))
            .await
    }

    async fn add_finalizer(&self, key: &EnvironmentKey) -> Result<(), ClientError> {
        self.retrier
            .run("add finalizer", || self.inner.add_finalizer(key))
            .await
    }

    async fn remove_finalizer(&self, key: &EnvironmentKey) -> Result<(), ClientError> {
        self.retrier
            .run("remove finalizer", || self.inner.remove_finalizer(key))
            .await
    }

    async fn delete(&self, key: &EnvironmentKey) -> Result<(), ClientError> {
        self.retrier
            .run("delete environment", || self.inner.delete(key))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::Phase;
    use crate::retry::MockClock;
    use crate::testing::{InMemoryStore, sample_spec};
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

    fn running() -> DevEnvironmentStatus {
        DevEnvironmentStatus {
            phase: Phase::Running,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn conflicting_status_write_is_retried() {
        let clock = Arc::new(MockClock::default());
        let inner = Arc::new(InMemoryStore::new());
        let key = inner.create("kubedev", "env1", sample_spec("u1"));
        inner.fail_next_writes(ClientError::Conflict("stale".into()), 2);
        let store = RetryingStore::new(inner.clone(), policy(), clock.clone());

        store
            .patch_status(&key, &running())
            .await
            .expect("third attempt lands");

        assert_eq!(inner.phase(&key), Some(Phase::Running));
        assert_eq!(inner.status_writes(), 1);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test]
    async fn finalizer_write_gives_up_at_the_ceiling() {
        let clock = Arc::new(MockClock::default());
        let inner = Arc::new(InMemoryStore::new());
        let key = inner.create("kubedev", "env1", sample_spec("u1"));
        inner.fail_next_writes(ClientError::Unavailable("503".into()), 10);
        let store = RetryingStore::new(inner.clone(), policy(), clock.clone());

        let err = store.add_finalizer(&key).await.expect_err("ceiling reached");

        assert!(matches!(err, ClientError::Exhausted { attempts: 3, .. }));
        assert!(!inner.env(&key).expect("env").has_finalizer());
    }

    #[tokio::test]
    async fn missing_environment_is_not_retried() {
        let clock = Arc::new(MockClock::default());
        let store = RetryingStore::new(Arc::new(InMemoryStore::new()), policy(), clock.clone());

        let err = store
            .patch_status(&EnvironmentKey::new("kubedev", "ghost"), &running())
            .await
            .expect_err("missing");

        assert!(matches!(err, ClientError::NotFound(_)));
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn status_patch_nulls_cleared_fields() {
        let status = DevEnvironmentStatus {
            phase: Phase::Stopped,
            message: Some("Workspace stopped".to_string()),
            ..Default::default()
        };
        let patch = status_patch(&status).expect("patch");

        assert_eq!(patch["phase"], "Stopped");
        assert_eq!(patch["message"], "Workspace stopped");
        assert!(patch["accessURL"].is_null());
        assert!(patch.as_object().expect("object").contains_key("accessURL"));
    }
}
