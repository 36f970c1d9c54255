//! In-memory DevEnvironment store.

use crate::crd::{
    DevEnvironment, DevEnvironmentSpec, DevEnvironmentStatus, EnvironmentKey, FINALIZER, Phase,
};
use crate::error::ClientError;
use crate::store::EnvironmentStore;
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Default)]
struct StoreState {
    envs: BTreeMap<EnvironmentKey, DevEnvironment>,
    status_writes: usize,
    write_failures: Option<(ClientError, u32)>,
    next_uid: u64,
}

impl StoreState {
    fn scripted_failure(&mut self) -> Result<(), ClientError> {
        match self.write_failures.as_mut() {
            Some((error, remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Err(error.clone())
            }
            _ => Ok(()),
        }
    }
}

/// [`EnvironmentStore`] held in memory.
///
/// Mirrors the API server where the reconciler can tell the difference:
/// generation moves only on spec changes, and deletion waits for
/// finalizers.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an environment at generation 1.
    pub fn create(&self, namespace: &str, name: &str, spec: DevEnvironmentSpec) -> EnvironmentKey {
        let mut state = self.state.lock();
        state.next_uid += 1;
        let mut env = DevEnvironment::new(name, spec);
        env.metadata.namespace = Some(namespace.to_string());
        env.metadata.generation = Some(1);
        env.metadata.uid = Some(format!("uid-{}", state.next_uid));
        let key = env.key();
        state.envs.insert(key.clone(), env);
        key
    }

    /// Current object.
    pub fn env(&self, key: &EnvironmentKey) -> Option<DevEnvironment> {
        self.state.lock().envs.get(key).cloned()
    }

    /// Current status.
    pub fn status(&self, key: &EnvironmentKey) -> Option<DevEnvironmentStatus> {
        self.env(key).and_then(|env| env.status)
    }

    /// Current phase; `Pending` before the first status write.
    pub fn phase(&self, key: &EnvironmentKey) -> Option<Phase> {
        self.env(key).map(|env| env.phase())
    }

    /// Number of status writes so far.
    pub fn status_writes(&self) -> usize {
        self.state.lock().status_writes
    }

    /// Fail the next `times` writes of any kind with `error`.
    pub fn fail_next_writes(&self, error: ClientError, times: u32) {
        self.state.lock().write_failures = Some((error, times));
    }

    /// Edit the spec in place, bumping the generation.
    pub fn update_spec(&self, key: &EnvironmentKey, edit: impl FnOnce(&mut DevEnvironmentSpec)) {
        let mut state = self.state.lock();
        if let Some(env) = state.envs.get_mut(key) {
            edit(&mut env.spec);
            env.metadata.generation = Some(env.metadata.generation.unwrap_or(0) + 1);
        }
    }

    fn not_found(key: &EnvironmentKey) -> ClientError {
        ClientError::NotFound(format!("DevEnvironment {key}"))
    }
}

fn merge(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match (target, patch) {
        (serde_json::Value::Object(target), serde_json::Value::Object(patch)) => {
            for (field, value) in patch {
                if value.is_null() {
                    target.remove(field);
                } else {
                    merge(
                        target.entry(field.clone()).or_insert(serde_json::Value::Null),
                        value,
                    );
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

#[async_trait]
impl EnvironmentStore for InMemoryStore {
    async fn get(&self, key: &EnvironmentKey) -> Result<Option<DevEnvironment>, ClientError> {
        Ok(self.env(key))
    }

    async fn list(&self) -> Result<Vec<DevEnvironment>, ClientError> {
        Ok(self.state.lock().envs.values().cloned().collect())
    }

    async fn patch_status(
        &self,
        key: &EnvironmentKey,
        status: &DevEnvironmentStatus,
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        state.scripted_failure()?;
        let env = state.envs.get_mut(key).ok_or_else(|| Self::not_found(key))?;
        env.status = Some(status.clone());
        state.status_writes += 1;
        Ok(())
    }

    async fn patch_spec(
        &self,
        key: &EnvironmentKey,
        patch: serde_json::Value,
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        state.scripted_failure()?;
        let env = state.envs.get_mut(key).ok_or_else(|| Self::not_found(key))?;
        let mut spec =
            serde_json::to_value(&env.spec).map_err(|e| ClientError::Invalid(e.to_string()))?;
        let before = spec.clone();
        merge(&mut spec, &patch);
        if spec == before {
            return Ok(());
        }
        env.spec = serde_json::from_value(spec).map_err(|e| ClientError::Invalid(e.to_string()))?;
        env.metadata.generation = Some(env.metadata.generation.unwrap_or(0) + 1);
        Ok(())
    }

    async fn add_finalizer(&self, key: &EnvironmentKey) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        state.scripted_failure()?;
        if let Some(env) = state.envs.get_mut(key) {
            let finalizers = env.metadata.finalizers.get_or_insert_with(Vec::new);
            if !finalizers.iter().any(|f| f == FINALIZER) {
                finalizers.push(FINALIZER.to_string());
            }
        }
        Ok(())
    }

    async fn remove_finalizer(&self, key: &EnvironmentKey) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        state.scripted_failure()?;
        let Some(env) = state.envs.get_mut(key) else {
            return Ok(());
        };
        if let Some(finalizers) = env.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != FINALIZER);
        }
        let released = env
            .metadata
            .finalizers
            .as_ref()
            .map_or(true, |f| f.is_empty());
        if env.is_deleting() && released {
            state.envs.remove(key);
        }
        Ok(())
    }

    async fn delete(&self, key: &EnvironmentKey) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        state.scripted_failure()?;
        let Some(env) = state.envs.get_mut(key) else {
            return Ok(());
        };
        let pending = env
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| !f.is_empty());
        if pending {
            if env.metadata.deletion_timestamp.is_none() {
                env.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            }
        } else {
            state.envs.remove(key);
        }
        Ok(())
    }
}
