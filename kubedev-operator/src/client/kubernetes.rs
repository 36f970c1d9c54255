//! [`ClusterClient`] backed by the Kubernetes API.

use super::{ClusterClient, FIELD_MANAGER, ObjectKind, ProjectedObject, describe};
use crate::error::ClientError;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, ResourceQuota, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

/// Cluster client using typed `kube::Api` handles.
///
/// Updates use server-side apply with field manager `kubedev-operator`.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    request_timeout: Duration,
}

impl KubeClusterClient {
    /// Create a client with the given per-request timeout.
    pub fn new(client: Client, request_timeout: Duration) -> Self {
        Self {
            client,
            request_timeout,
        }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn cluster<K>(&self) -> Api<K>
    where
        K: Resource<Scope = ClusterResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::all(self.client.clone())
    }

    fn everywhere<K>(&self) -> Api<K>
    where
        K: Resource,
        <K as Resource>::DynamicType: Default,
    {
        Api::all(self.client.clone())
    }

    async fn call<T, F>(&self, what: String, fut: F) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result.map_err(ClientError::from),
            Err(_) => Err(ClientError::Timeout(format!(
                "{what} after {:?}",
                self.request_timeout
            ))),
        }
    }

    async fn get_in<K>(&self, api: Api<K>, name: &str, what: String) -> Result<Option<K>, ClientError>
    where
        K: Clone + DeserializeOwned + Debug,
    {
        self.call(what, api.get_opt(name)).await
    }

    async fn create_in<K>(&self, api: Api<K>, object: &K, what: String) -> Result<(), ClientError>
    where
        K: Clone + DeserializeOwned + Serialize + Debug,
    {
        match self.call(what, api.create(&PostParams::default(), object)).await {
            Ok(_) | Err(ClientError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn apply_in<K>(
        &self,
        api: Api<K>,
        name: &str,
        object: &K,
        what: String,
    ) -> Result<(), ClientError>
    where
        K: Clone + DeserializeOwned + Serialize + Debug,
    {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.call(what, api.patch(name, &params, &Patch::Apply(object)))
            .await
            .map(|_| ())
    }

    async fn delete_in<K>(&self, api: Api<K>, name: &str, what: String) -> Result<(), ClientError>
    where
        K: Clone + DeserializeOwned + Debug,
    {
        match self.call(what, api.delete(name, &DeleteParams::background())).await {
            Ok(_) | Err(ClientError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_in<K>(
        &self,
        api: Api<K>,
        selector: &str,
        what: String,
    ) -> Result<Vec<K>, ClientError>
    where
        K: Clone + DeserializeOwned + Debug,
    {
        let params = ListParams::default().labels(selector);
        self.call(what, api.list(&params)).await.map(|list| list.items)
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ProjectedObject>, ClientError> {
        let what = format!("get {}", describe(kind, namespace, name));
        let object = match kind {
            ObjectKind::Namespace => self
                .get_in(self.cluster::<Namespace>(), name, what)
                .await?
                .map(ProjectedObject::Namespace),
            ObjectKind::ResourceQuota => self
                .get_in(self.namespaced::<ResourceQuota>(namespace), name, what)
                .await?
                .map(ProjectedObject::ResourceQuota),
            ObjectKind::PersistentVolumeClaim => self
                .get_in(self.namespaced::<PersistentVolumeClaim>(namespace), name, what)
                .await?
                .map(ProjectedObject::PersistentVolumeClaim),
            ObjectKind::Deployment => self
                .get_in(self.namespaced::<Deployment>(namespace), name, what)
                .await?
                .map(ProjectedObject::Deployment),
            ObjectKind::Service => self
                .get_in(self.namespaced::<Service>(namespace), name, what)
                .await?
                .map(ProjectedObject::Service),
            ObjectKind::Ingress => self
                .get_in(self.namespaced::<Ingress>(namespace), name, what)
                .await?
                .map(ProjectedObject::Ingress),
        };
        Ok(object)
    }

    async fn create(&self, object: &ProjectedObject) -> Result<(), ClientError> {
        let what = format!("create {}", object.describe());
        let namespace = object.namespace();
        match object {
            ProjectedObject::Namespace(o) => self.create_in(self.cluster(), o, what).await,
            ProjectedObject::ResourceQuota(o) => {
                self.create_in(self.namespaced(namespace), o, what).await
            }
            ProjectedObject::PersistentVolumeClaim(o) => {
                self.create_in(self.namespaced(namespace), o, what).await
            }
            ProjectedObject::Deployment(o) => {
                self.create_in(self.namespaced(namespace), o, what).await
            }
            ProjectedObject::Service(o) => {
                self.create_in(self.namespaced(namespace), o, what).await
            }
            ProjectedObject::Ingress(o) => {
                self.create_in(self.namespaced(namespace), o, what).await
            }
        }
    }

    async fn update(&self, object: &ProjectedObject) -> Result<(), ClientError> {
        let what = format!("apply {}", object.describe());
        let (namespace, name) = (object.namespace(), object.name());
        match object {
            ProjectedObject::Namespace(o) => self.apply_in(self.cluster(), name, o, what).await,
            ProjectedObject::ResourceQuota(o) => {
                self.apply_in(self.namespaced(namespace), name, o, what).await
            }
            ProjectedObject::PersistentVolumeClaim(o) => {
                self.apply_in(self.namespaced(namespace), name, o, what).await
            }
            ProjectedObject::Deployment(o) => {
                self.apply_in(self.namespaced(namespace), name, o, what).await
            }
            ProjectedObject::Service(o) => {
                self.apply_in(self.namespaced(namespace), name, o, what).await
            }
            ProjectedObject::Ingress(o) => {
                self.apply_in(self.namespaced(namespace), name, o, what).await
            }
        }
    }

    async fn delete(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        let what = format!("delete {}", describe(kind, namespace, name));
        match kind {
            ObjectKind::Namespace => {
                self.delete_in(self.cluster::<Namespace>(), name, what).await
            }
            ObjectKind::ResourceQuota => {
                self.delete_in(self.namespaced::<ResourceQuota>(namespace), name, what)
                    .await
            }
            ObjectKind::PersistentVolumeClaim => {
                self.delete_in(self.namespaced::<PersistentVolumeClaim>(namespace), name, what)
                    .await
            }
            ObjectKind::Deployment => {
                self.delete_in(self.namespaced::<Deployment>(namespace), name, what)
                    .await
            }
            ObjectKind::Service => {
                self.delete_in(self.namespaced::<Service>(namespace), name, what)
                    .await
            }
            ObjectKind::Ingress => {
                self.delete_in(self.namespaced::<Ingress>(namespace), name, what)
                    .await
            }
        }
    }

    async fn list(
        &self,
        kind: ObjectKind,
        label_selector: &str,
    ) -> Result<Vec<ProjectedObject>, ClientError> {
        let what = format!("list {kind} with {label_selector}");
        let objects = match kind {
            ObjectKind::Namespace => self
                .list_in(self.everywhere::<Namespace>(), label_selector, what)
                .await?
                .into_iter()
                .map(ProjectedObject::Namespace)
                .collect(),
            ObjectKind::ResourceQuota => self
                .list_in(self.everywhere::<ResourceQuota>(), label_selector, what)
                .await?
                .into_iter()
                .map(ProjectedObject::ResourceQuota)
                .collect(),
            ObjectKind::PersistentVolumeClaim => self
                .list_in(self.everywhere::<PersistentVolumeClaim>(), label_selector, what)
                .await?
                .into_iter()
                .map(ProjectedObject::PersistentVolumeClaim)
                .collect(),
            ObjectKind::Deployment => self
                .list_in(self.everywhere::<Deployment>(), label_selector, what)
                .await?
                .into_iter()
                .map(ProjectedObject::Deployment)
                .collect(),
            ObjectKind::Service => self
                .list_in(self.everywhere::<Service>(), label_selector, what)
                .await?
                .into_iter()
                .map(ProjectedObject::Service)
                .collect(),
            ObjectKind::Ingress => self
                .list_in(self.everywhere::<Ingress>(), label_selector, what)
                .await?
                .into_iter()
                .map(ProjectedObject::Ingress)
                .collect(),
        };
        Ok(objects)
    }
}
