//! Observed cluster state for one reconciliation.
//!
//! [`ObservedProjection`] is a read-through cache that lives only for the
//! duration of a single reconcile call. Every value in it comes from a get
//! against the cluster; writes invalidate the affected kind.

use crate::builder::PROJECTION_HASH;
use crate::client::{ClusterClient, ObjectKind, ProjectedObject};
use crate::error::ClientError;
use std::collections::HashMap;

/// Per-reconciliation cache of the live projection.
pub struct ObservedProjection<'a> {
    client: &'a dyn ClusterClient,
    namespace: String,
    cache: HashMap<ObjectKind, Option<ProjectedObject>>,
}

impl<'a> ObservedProjection<'a> {
    /// Empty cache for objects in `namespace`.
    pub fn new(client: &'a dyn ClusterClient, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            cache: HashMap::new(),
        }
    }

    /// Live object of `kind`, fetched on first access.
    pub async fn get(
        &mut self,
        kind: ObjectKind,
        name: &str,
    ) -> Result<Option<&ProjectedObject>, ClientError> {
        if !self.cache.contains_key(&kind) {
            let object = self.client.get(kind, &self.namespace, name).await?;
            self.cache.insert(kind, object);
        }
        Ok(self.cache.get(&kind).and_then(Option::as_ref))
    }

    /// Forget what is known about `kind`.
    pub fn invalidate(&mut self, kind: ObjectKind) {
        self.cache.remove(&kind);
    }
}

/// Whether the live object differs from the desired one.
///
/// Compares the projection hash, then the fields most likely to be edited
/// out of band.
pub fn needs_update(desired: &ProjectedObject, live: &ProjectedObject) -> bool {
    if desired.annotation(PROJECTION_HASH) != live.annotation(PROJECTION_HASH) {
        return true;
    }
    match (desired, live) {
        (ProjectedObject::Deployment(d), ProjectedObject::Deployment(l)) => {
            let replicas = |o: &k8s_openapi::api::apps::v1::Deployment| {
                o.spec.as_ref().and_then(|s| s.replicas)
            };
            let images = |o: &k8s_openapi::api::apps::v1::Deployment| -> Vec<Option<String>> {
                o.spec
                    .as_ref()
                    .and_then(|s| s.template.spec.as_ref())
                    .map(|p| p.containers.iter().map(|c| c.image.clone()).collect())
                    .unwrap_or_default()
            };
            replicas(d) != replicas(l) || images(d) != images(l)
        }
        (ProjectedObject::Service(d), ProjectedObject::Service(l)) => {
            let ports = |o: &k8s_openapi::api::core::v1::Service| -> Vec<i32> {
                o.spec
                    .as_ref()
                    .and_then(|s| s.ports.as_ref())
                    .map(|ports| ports.iter().map(|p| p.port).collect())
                    .unwrap_or_default()
            };
            ports(d) != ports(l)
        }
        (ProjectedObject::Ingress(d), ProjectedObject::Ingress(l)) => {
            let hosts = |o: &k8s_openapi::api::networking::v1::Ingress| -> Vec<Option<String>> {
                o.spec
                    .as_ref()
                    .and_then(|s| s.rules.as_ref())
                    .map(|rules| rules.iter().map(|r| r.host.clone()).collect())
                    .unwrap_or_default()
            };
            hosts(d) != hosts(l)
        }
        _ => false,
    }
}

/// At least one replica is ready.
pub fn deployment_ready(object: &ProjectedObject) -> bool {
    match object {
        ProjectedObject::Deployment(d) => {
            d.status
                .as_ref()
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0)
                >= 1
        }
        _ => false,
    }
}

/// The namespace is being deleted.
pub fn namespace_terminating(object: &ProjectedObject) -> bool {
    match object {
        ProjectedObject::Namespace(ns) => {
            ns.metadata.deletion_timestamp.is_some()
                || ns
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    == Some("Terminating")
        }
        _ => false,
    }
}

/// Cluster IP of a service, if allocated.
pub fn cluster_ip(object: &ProjectedObject) -> Option<String> {
    match object {
        ProjectedObject::Service(svc) => svc
            .spec
            .as_ref()
            .and_then(|s| s.cluster_ip.clone())
            .filter(|ip| !ip.is_empty() && ip != "None"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build;
    use crate::config::ProjectionSettings;
    use crate::crd::{DevEnvironmentSpec, EnvironmentKey};
    use k8s_openapi::api::apps::v1::DeploymentStatus;

    fn projection() -> crate::builder::ProjectionSet {
        let spec = DevEnvironmentSpec {
            owner: "u1".to_string(),
            git_repository: None,
            git_ref: None,
            image: "base:latest".to_string(),
            init_commands: vec![],
            start_command: None,
            ports: vec![8080],
            resource_limits: None,
            storage_size: None,
            env: Default::default(),
            suspended: false,
            restart_nonce: None,
        };
        build(
            &EnvironmentKey::new("kubedev", "env1"),
            &spec,
            &ProjectionSettings::default(),
        )
        .expect("valid spec")
    }

    #[test]
    fn identical_objects_need_no_update() {
        let set = projection();
        for object in set.objects() {
            assert!(!needs_update(object, &object.clone()), "{}", object.describe());
        }
    }

    #[test]
    fn out_of_band_image_edit_is_drift() {
        let set = projection();
        let desired = set.get(ObjectKind::Deployment).expect("deployment").clone();
        let mut live = desired.clone();
        if let ProjectedObject::Deployment(d) = &mut live {
            let pod = d
                .spec
                .as_mut()
                .and_then(|s| s.template.spec.as_mut())
                .expect("pod spec");
            pod.containers[0].image = Some("evil:latest".to_string());
        }
        assert!(needs_update(&desired, &live));
    }

    #[test]
    fn server_populated_status_is_not_drift() {
        let set = projection();
        let desired = set.get(ObjectKind::Deployment).expect("deployment").clone();
        let mut live = desired.clone();
        if let ProjectedObject::Deployment(d) = &mut live {
            d.status = Some(DeploymentStatus {
                ready_replicas: Some(1),
                ..Default::default()
            });
            d.metadata.resource_version = Some("42".to_string());
        }
        assert!(!needs_update(&desired, &live));
        assert!(deployment_ready(&live));
        assert!(!deployment_ready(&desired));
    }
}
