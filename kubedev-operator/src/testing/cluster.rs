//! Fake cluster API.

use crate::client::{ClusterClient, ObjectKind, ProjectedObject, describe};
use crate::error::ClientError;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DeploymentStatus;
use k8s_openapi::api::core::v1::NamespaceStatus;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Cluster API verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Read one object.
    Get,
    /// List objects.
    List,
    /// Create.
    Create,
    /// Update.
    Update,
    /// Delete.
    Delete,
}

impl Verb {
    /// Whether the verb changes cluster state.
    pub fn is_mutating(self) -> bool {
        matches!(self, Verb::Create | Verb::Update | Verb::Delete)
    }
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterCall {
    /// Verb.
    pub verb: Verb,
    /// Object kind.
    pub kind: ObjectKind,
    /// Namespace, or the label selector for lists.
    pub namespace: String,
    /// Object name; empty for lists.
    pub name: String,
}

type ObjectKey = (ObjectKind, String, String);

struct ScriptedFailure {
    verb: Verb,
    kind: ObjectKind,
    error: ClientError,
    remaining: u32,
}

#[derive(Default)]
struct FakeState {
    objects: BTreeMap<ObjectKey, ProjectedObject>,
    calls: Vec<ClusterCall>,
    failures: Vec<ScriptedFailure>,
    next_ip: u32,
    resource_version: u64,
}

/// In-memory [`ClusterClient`] that records every call.
///
/// Creating into a missing namespace fails like the real API server;
/// deleting a namespace removes everything in it at once.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<FakeState>>,
}

fn object_key(kind: ObjectKind, namespace: &str, name: &str) -> ObjectKey {
    if kind.is_namespaced() {
        (kind, namespace.to_string(), name.to_string())
    } else {
        (kind, name.to_string(), name.to_string())
    }
}

fn matches_selector(object: &ProjectedObject, selector: &str) -> bool {
    let labels = object.labels();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.and_then(|l| l.get(k.trim())).map(String::as_str) == Some(v.trim()),
            None => false,
        })
}

impl FakeCluster {
    /// Empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls of `verb` on `kind` with `error`.
    pub fn fail_next(&self, verb: Verb, kind: ObjectKind, error: ClientError, times: u32) {
        self.state.lock().failures.push(ScriptedFailure {
            verb,
            kind,
            error,
            remaining: times,
        });
    }

    /// Every call so far.
    pub fn calls(&self) -> Vec<ClusterCall> {
        self.state.lock().calls.clone()
    }

    /// Create, update and delete calls so far.
    pub fn mutating_calls(&self) -> Vec<ClusterCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.verb.is_mutating())
            .collect()
    }

    /// Number of calls of `verb` on `kind`.
    pub fn count(&self, verb: Verb, kind: ObjectKind) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.verb == verb && c.kind == kind)
            .count()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Current object, if present.
    pub fn object(&self, kind: ObjectKind, namespace: &str, name: &str) -> Option<ProjectedObject> {
        self.state
            .lock()
            .objects
            .get(&object_key(kind, namespace, name))
            .cloned()
    }

    /// Whether the object exists.
    pub fn contains(&self, kind: ObjectKind, namespace: &str, name: &str) -> bool {
        self.object(kind, namespace, name).is_some()
    }

    /// Every object whose label `key` equals `value`.
    pub fn labeled(&self, key: &str, value: &str) -> Vec<ProjectedObject> {
        let selector = format!("{key}={value}");
        self.state
            .lock()
            .objects
            .values()
            .filter(|o| matches_selector(o, &selector))
            .cloned()
            .collect()
    }

    /// Total number of objects.
    pub fn len(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Whether the cluster holds no objects.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store an object directly, without recording a call.
    pub fn insert(&self, object: ProjectedObject) {
        let key = object_key(object.kind(), object.namespace(), object.name());
        self.state.lock().objects.insert(key, object);
    }

    /// Modify an object in place, as an out-of-band edit would.
    pub fn edit(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
        edit: impl FnOnce(&mut ProjectedObject),
    ) -> bool {
        let mut state = self.state.lock();
        match state.objects.get_mut(&object_key(kind, namespace, name)) {
            Some(object) => {
                edit(object);
                true
            }
            None => false,
        }
    }

    /// Report `ready` ready replicas on a deployment.
    pub fn set_ready_replicas(&self, namespace: &str, name: &str, ready: i32) -> bool {
        self.edit(ObjectKind::Deployment, namespace, name, |object| {
            if let ProjectedObject::Deployment(d) = object {
                d.status = Some(DeploymentStatus {
                    replicas: Some(ready.max(1)),
                    ready_replicas: Some(ready),
                    ..Default::default()
                });
            }
        })
    }

    fn begin(
        &self,
        verb: Verb,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<parking_lot::MutexGuard<'_, FakeState>, ClientError> {
        let mut state = self.state.lock();
        state.calls.push(ClusterCall {
            verb,
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        if let Some(failure) = state
            .failures
            .iter_mut()
            .find(|f| f.verb == verb && f.kind == kind && f.remaining > 0)
        {
            failure.remaining -= 1;
            return Err(failure.error.clone());
        }
        Ok(state)
    }
}

impl FakeState {
    fn bump(&mut self, object: &mut ProjectedObject) {
        self.resource_version += 1;
        object.meta_mut().resource_version = Some(self.resource_version.to_string());
    }

    /// Fill in what the API server would.
    fn admit(&mut self, object: &mut ProjectedObject, previous: Option<&ProjectedObject>) {
        self.bump(object);
        match (object, previous) {
            (ProjectedObject::Namespace(ns), _) => {
                ns.status = Some(NamespaceStatus {
                    phase: Some("Active".to_string()),
                    ..Default::default()
                });
            }
            (ProjectedObject::Deployment(d), Some(ProjectedObject::Deployment(old))) => {
                d.status = old.status.clone();
            }
            (ProjectedObject::Service(svc), previous) => {
                let kept = match previous {
                    Some(ProjectedObject::Service(old)) => {
                        old.spec.as_ref().and_then(|s| s.cluster_ip.clone())
                    }
                    _ => None,
                };
                let ip = kept.unwrap_or_else(|| {
                    self.next_ip += 1;
                    format!("10.96.0.{}", self.next_ip)
                });
                if let Some(spec) = svc.spec.as_mut() {
                    spec.cluster_ip = Some(ip);
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ProjectedObject>, ClientError> {
        let state = self.begin(Verb::Get, kind, namespace, name)?;
        Ok(state.objects.get(&object_key(kind, namespace, name)).cloned())
    }

    async fn create(&self, object: &ProjectedObject) -> Result<(), ClientError> {
        let (kind, namespace, name) = (object.kind(), object.namespace(), object.name());
        let mut state = self.begin(Verb::Create, kind, namespace, name)?;
        let key = object_key(kind, namespace, name);
        if state.objects.contains_key(&key) {
            return Ok(());
        }
        if kind.is_namespaced()
            && !state
                .objects
                .contains_key(&object_key(ObjectKind::Namespace, namespace, namespace))
        {
            return Err(ClientError::NotFound(format!("namespace {namespace}")));
        }
        let mut stored = object.clone();
        state.admit(&mut stored, None);
        state.objects.insert(key, stored);
        Ok(())
    }

    async fn update(&self, object: &ProjectedObject) -> Result<(), ClientError> {
        let (kind, namespace, name) = (object.kind(), object.namespace(), object.name());
        let mut state = self.begin(Verb::Update, kind, namespace, name)?;
        let key = object_key(kind, namespace, name);
        let Some(previous) = state.objects.get(&key).cloned() else {
            return Err(ClientError::NotFound(describe(kind, namespace, name)));
        };
        let mut stored = object.clone();
        state.admit(&mut stored, Some(&previous));
        state.objects.insert(key, stored);
        Ok(())
    }

    async fn delete(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        let mut state = self.begin(Verb::Delete, kind, namespace, name)?;
        state.objects.remove(&object_key(kind, namespace, name));
        if kind == ObjectKind::Namespace {
            state
                .objects
                .retain(|(k, ns, _), _| !(k.is_namespaced() && ns == name));
        }
        Ok(())
    }

    async fn list(
        &self,
        kind: ObjectKind,
        label_selector: &str,
    ) -> Result<Vec<ProjectedObject>, ClientError> {
        let state = self.begin(Verb::List, kind, label_selector, "")?;
        Ok(state
            .objects
            .values()
            .filter(|o| o.kind() == kind && matches_selector(o, label_selector))
            .cloned()
            .collect())
    }
}
