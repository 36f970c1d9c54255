//! Cluster client adapter.
//!
//! [`ClusterClient`] is the only path from the reconciler to the cluster API.
//! Calls are idempotent: creating an object that exists and deleting one
//! that is gone both succeed. [`RetryingClient`] adds per-call retries for
//! transient failures on top of any implementation.

mod kubernetes;
mod retrying;

pub use kubernetes::KubeClusterClient;
pub use retrying::RetryingClient;

use crate::error::ClientError;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, ResourceQuota, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::fmt;

/// Field manager for server-side apply.
pub const FIELD_MANAGER: &str = "kubedev-operator";

/// Kinds of cluster objects in a projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    /// Workspace namespace.
    Namespace,
    /// Namespace quota.
    ResourceQuota,
    /// Workspace volume.
    PersistentVolumeClaim,
    /// Workspace pods.
    Deployment,
    /// In-cluster endpoint.
    Service,
    /// External route.
    Ingress,
}

impl ObjectKind {
    /// Creation order. Teardown walks it backwards.
    pub const APPLY_ORDER: [ObjectKind; 6] = [
        ObjectKind::Namespace,
        ObjectKind::ResourceQuota,
        ObjectKind::PersistentVolumeClaim,
        ObjectKind::Deployment,
        ObjectKind::Service,
        ObjectKind::Ingress,
    ];

    /// Whether objects of this kind live inside a namespace.
    pub fn is_namespaced(self) -> bool {
        !matches!(self, ObjectKind::Namespace)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObjectKind::Namespace => "Namespace",
            ObjectKind::ResourceQuota => "ResourceQuota",
            ObjectKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ObjectKind::Deployment => "Deployment",
            ObjectKind::Service => "Service",
            ObjectKind::Ingress => "Ingress",
        };
        f.write_str(s)
    }
}

/// A typed cluster object of one of the projected kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectedObject {
    /// Namespace.
    Namespace(Namespace),
    /// ResourceQuota.
    ResourceQuota(ResourceQuota),
    /// PersistentVolumeClaim.
    PersistentVolumeClaim(PersistentVolumeClaim),
    /// Deployment.
    Deployment(Deployment),
    /// Service.
    Service(Service),
    /// Ingress.
    Ingress(Ingress),
}

impl ProjectedObject {
    /// Kind of the wrapped object.
    pub fn kind(&self) -> ObjectKind {
        match self {
            ProjectedObject::Namespace(_) => ObjectKind::Namespace,
            ProjectedObject::ResourceQuota(_) => ObjectKind::ResourceQuota,
            ProjectedObject::PersistentVolumeClaim(_) => ObjectKind::PersistentVolumeClaim,
            ProjectedObject::Deployment(_) => ObjectKind::Deployment,
            ProjectedObject::Service(_) => ObjectKind::Service,
            ProjectedObject::Ingress(_) => ObjectKind::Ingress,
        }
    }

    /// Object metadata.
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            ProjectedObject::Namespace(o) => &o.metadata,
            ProjectedObject::ResourceQuota(o) => &o.metadata,
            ProjectedObject::PersistentVolumeClaim(o) => &o.metadata,
            ProjectedObject::Deployment(o) => &o.metadata,
            ProjectedObject::Service(o) => &o.metadata,
            ProjectedObject::Ingress(o) => &o.metadata,
        }
    }

    /// Mutable object metadata.
    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            ProjectedObject::Namespace(o) => &mut o.metadata,
            ProjectedObject::ResourceQuota(o) => &mut o.metadata,
            ProjectedObject::PersistentVolumeClaim(o) => &mut o.metadata,
            ProjectedObject::Deployment(o) => &mut o.metadata,
            ProjectedObject::Service(o) => &mut o.metadata,
            ProjectedObject::Ingress(o) => &mut o.metadata,
        }
    }

    /// Object name.
    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    /// Namespace the object lives in; the object's own name for namespaces.
    pub fn namespace(&self) -> &str {
        match self {
            ProjectedObject::Namespace(_) => self.name(),
            _ => self.meta().namespace.as_deref().unwrap_or_default(),
        }
    }

    /// Object labels.
    pub fn labels(&self) -> Option<&BTreeMap<String, String>> {
        self.meta().labels.as_ref()
    }

    /// Single annotation value.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.meta()
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Serialize the wrapped object.
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            ProjectedObject::Namespace(o) => serde_json::to_value(o),
            ProjectedObject::ResourceQuota(o) => serde_json::to_value(o),
            ProjectedObject::PersistentVolumeClaim(o) => serde_json::to_value(o),
            ProjectedObject::Deployment(o) => serde_json::to_value(o),
            ProjectedObject::Service(o) => serde_json::to_value(o),
            ProjectedObject::Ingress(o) => serde_json::to_value(o),
        }
    }

    /// `Kind namespace/name`, for logs and errors.
    pub fn describe(&self) -> String {
        describe(self.kind(), self.namespace(), self.name())
    }
}

/// `Kind namespace/name`, for logs and errors.
pub fn describe(kind: ObjectKind, namespace: &str, name: &str) -> String {
    if kind.is_namespaced() {
        format!("{kind} {namespace}/{name}")
    } else {
        format!("{kind} {name}")
    }
}

/// Cluster API access for the projected object kinds.
///
/// For [`ObjectKind::Namespace`] the `namespace` argument is ignored.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch an object; `Ok(None)` when it does not exist.
    async fn get(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ProjectedObject>, ClientError>;

    /// Create an object. Succeeds when it already exists.
    async fn create(&self, object: &ProjectedObject) -> Result<(), ClientError>;

    /// Bring an existing object to the given content.
    async fn update(&self, object: &ProjectedObject) -> Result<(), ClientError>;

    /// Delete an object. Succeeds when it does not exist.
    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str)
    -> Result<(), ClientError>;

    /// List objects of `kind` in every namespace matching `label_selector`.
    async fn list(
        &self,
        kind: ObjectKind,
        label_selector: &str,
    ) -> Result<Vec<ProjectedObject>, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_reports_itself_as_namespace() {
        let ns = ProjectedObject::Namespace(Namespace {
            metadata: ObjectMeta {
                name: Some("ws-u1-env1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        assert_eq!(ns.namespace(), "ws-u1-env1");
        assert_eq!(ns.describe(), "Namespace ws-u1-env1");
    }

    #[test]
    fn teardown_is_reverse_apply_order() {
        let mut teardown = ObjectKind::APPLY_ORDER;
        teardown.reverse();
        assert_eq!(teardown[0], ObjectKind::Ingress);
        assert_eq!(teardown[5], ObjectKind::Namespace);
    }
}
