//! Lifecycle actions as spec mutations.
//!
//! The REST backend expresses `stop`, `start`, `restart` and `delete` as
//! changes to the DevEnvironment object; the reconciler picks them up like
//! any other spec edit.

use crate::crd::EnvironmentKey;
use crate::error::ClientError;
use crate::retry::Clock;
use crate::store::EnvironmentStore;
use std::sync::Arc;

/// Lifecycle verbs over an [`EnvironmentStore`].
#[derive(Clone)]
pub struct EnvironmentActions {
    store: Arc<dyn EnvironmentStore>,
    clock: Arc<dyn Clock>,
}

impl EnvironmentActions {
    /// Create the action set.
    pub fn new(store: Arc<dyn EnvironmentStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Stop the workspace, keeping its storage.
    pub async fn stop(&self, key: &EnvironmentKey) -> Result<(), ClientError> {
        self.require(key).await?;
        tracing::info!(environment = %key, "Stopping workspace");
        self.store
            .patch_spec(key, serde_json::json!({ "suspended": true }))
            .await
    }

    /// Start a stopped workspace.
    pub async fn start(&self, key: &EnvironmentKey) -> Result<(), ClientError> {
        self.require(key).await?;
        tracing::info!(environment = %key, "Starting workspace");
        self.store
            .patch_spec(key, serde_json::json!({ "suspended": false }))
            .await
    }

    /// Recreate the workspace pods. Also starts a stopped workspace.
    pub async fn restart(&self, key: &EnvironmentKey) -> Result<String, ClientError> {
        let env = self.require(key).await?;
        let stamp = self
            .clock
            .now()
            .format("%Y%m%dT%H%M%S%.6fZ")
            .to_string();
        let nonce = next_nonce(stamp, env.spec.restart_nonce.as_deref());

        tracing::info!(environment = %key, nonce = %nonce, "Restarting workspace");
        self.store
            .patch_spec(
                key,
                serde_json::json!({ "suspended": false, "restartNonce": nonce }),
            )
            .await?;
        Ok(nonce)
    }

    /// Delete the environment. Teardown happens before the object goes away.
    pub async fn delete(&self, key: &EnvironmentKey) -> Result<(), ClientError> {
        tracing::info!(environment = %key, "Deleting environment");
        self.store.delete(key).await
    }

    async fn require(
        &self,
        key: &EnvironmentKey,
    ) -> Result<crate::crd::DevEnvironment, ClientError> {
        self.store
            .get(key)
            .await?
            .ok_or_else(|| ClientError::NotFound(format!("DevEnvironment {key}")))
    }
}

/// `stamp`, or `stamp-N` counting up while restarts share a timestamp.
fn next_nonce(stamp: String, previous: Option<&str>) -> String {
    let Some(previous) = previous else {
        return stamp;
    };
    if previous == stamp {
        return format!("{stamp}-1");
    }
    let counter = previous
        .strip_prefix(stamp.as_str())
        .and_then(|rest| rest.strip_prefix('-'))
        .and_then(|n| n.parse::<u64>().ok());
    match counter {
        Some(n) => format!("{stamp}-{}", n + 1),
        None => stamp,
    }
}
