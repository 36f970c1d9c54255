//! Resource builder: DevEnvironment spec to cluster objects.
//!
//! Everything here is pure. The same key, spec and settings always yield
//! byte-identical objects, which is what makes diffing against the live
//! cluster reliable.

use crate::client::{ObjectKind, ProjectedObject};
use crate::config::ProjectionSettings;
use crate::crd::{DevEnvironmentSpec, EnvironmentKey};
use crate::error::ValidationError;
use crate::naming::{
    self, static_regex, ENVIRONMENT_ANNOTATION, INSTANCE_LABEL, MANAGED_BY, MANAGED_BY_LABEL,
};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, Namespace, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec,
    Probe, ResourceQuota, ResourceQuotaSpec, ResourceRequirements, Service, ServicePort,
    ServiceSpec, TCPSocketAction, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

/// Annotation holding the SHA-256 of the object as built, before annotating.
pub const PROJECTION_HASH: &str = "kubedev.io/projection-hash";

/// Mount point of the workspace volume.
pub const WORKSPACE_MOUNT: &str = "/workspace";

const GIT_CLONE_CONTAINER: &str = "git-clone";
const INIT_CONTAINER: &str = "init";
const MAIN_CONTAINER: &str = "workspace";
const VOLUME_NAME: &str = "workspace";
const DEFAULT_GIT_REF: &str = "main";

/// Clones once; later pod starts find the checkout on the volume.
const GIT_CLONE_SCRIPT: &str = r#"if [ ! -d /workspace/src/.git ]; then git clone --branch "$GIT_REF" --single-branch -- "$GIT_REPOSITORY" /workspace/src; fi"#;

const RESERVED_ENV: [&str; 2] = ["KUBEDEV_OWNER", "KUBEDEV_ENVIRONMENT"];

/// `[registry[:port]/]path[:tag][@sha256:digest]`
static IMAGE_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    static_regex!(
        r"^[a-z0-9]+(?:[._-]+[a-z0-9]+)*(?::[0-9]+)?(?:/[a-z0-9]+(?:[._-]+[a-z0-9]+)*)*(?::[A-Za-z0-9_][A-Za-z0-9_.-]{0,127})?(?:@sha256:[a-f0-9]{64})?$",
        "IMAGE_REFERENCE"
    )
});

static QUANTITY: Lazy<Regex> = Lazy::new(|| {
    static_regex!(
        r"^[0-9]+(?:\.[0-9]+)?(?:m|k|M|G|T|P|E|Ki|Mi|Gi|Ti|Pi|Ei)?$",
        "QUANTITY"
    )
});

static ENV_NAME: Lazy<Regex> = Lazy::new(|| static_regex!(r"^[A-Za-z_][A-Za-z0-9_]*$", "ENV_NAME"));

/// Desired cluster objects for one environment.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionSet {
    /// Workspace namespace.
    pub namespace: String,
    /// Value of the ownership label.
    pub instance: String,
    /// Ingress host, when any port is exposed.
    pub host: Option<String>,
    /// First declared port; backs the ingress.
    pub primary_port: Option<i32>,
    objects: Vec<ProjectedObject>,
}

impl ProjectionSet {
    /// Desired objects in apply order.
    pub fn objects(&self) -> &[ProjectedObject] {
        &self.objects
    }

    /// Desired object of `kind`; `None` when that kind must not exist.
    pub fn get(&self, kind: ObjectKind) -> Option<&ProjectedObject> {
        self.objects.iter().find(|o| o.kind() == kind)
    }

    /// Name the object of `kind` has inside the workspace namespace.
    pub fn object_name(&self, kind: ObjectKind) -> &str {
        match kind {
            ObjectKind::Namespace => &self.namespace,
            ObjectKind::ResourceQuota => naming::QUOTA,
            ObjectKind::PersistentVolumeClaim => naming::VOLUME_CLAIM,
            ObjectKind::Deployment | ObjectKind::Service | ObjectKind::Ingress => {
                naming::WORKSPACE
            }
        }
    }

    /// URL the workspace is served on.
    pub fn access_url(&self) -> Option<String> {
        self.host.as_ref().map(|host| format!("http://{host}"))
    }
}

/// Check a spec without building anything.
pub fn validate(key: &EnvironmentKey, spec: &DevEnvironmentSpec) -> Result<(), ValidationError> {
    if key.name.is_empty() || !naming::is_dns_subdomain(&key.name) {
        return Err(ValidationError::InvalidName(key.name.clone()));
    }
    if spec.owner.trim().is_empty() {
        return Err(ValidationError::EmptyOwner);
    }

    let image = spec.image.trim();
    if image.is_empty() {
        return Err(ValidationError::EmptyImage);
    }
    if image.len() > 255 || !IMAGE_REFERENCE.is_match(image) {
        return Err(ValidationError::InvalidImage(spec.image.clone()));
    }

    let mut seen = HashSet::new();
    for &port in &spec.ports {
        if !(1..=65535).contains(&port) {
            return Err(ValidationError::PortOutOfRange(port));
        }
        if !seen.insert(port) {
            return Err(ValidationError::DuplicatePort(port));
        }
    }

    let limits = spec.resource_limits.clone().unwrap_or_default();
    let quantities = [
        ("resourceLimits.cpu", limits.cpu.as_deref()),
        ("resourceLimits.memory", limits.memory.as_deref()),
        ("resourceLimits.storage", limits.storage.as_deref()),
        ("storageSize", spec.storage_size.as_deref()),
    ];
    for (field, value) in quantities {
        if let Some(value) = value {
            if !QUANTITY.is_match(value) {
                return Err(ValidationError::InvalidQuantity {
                    field,
                    value: value.to_string(),
                });
            }
        }
    }

    for name in spec.env.keys() {
        if !ENV_NAME.is_match(name) || RESERVED_ENV.contains(&name.as_str()) {
            return Err(ValidationError::InvalidEnvName(name.clone()));
        }
    }

    Ok(())
}

/// Build the projection of the DevEnvironment at `key`.
///
/// A suspended spec yields no deployment. A spec without ports yields no
/// service and no ingress.
pub fn build(
    key: &EnvironmentKey,
    spec: &DevEnvironmentSpec,
    settings: &ProjectionSettings,
) -> Result<ProjectionSet, ValidationError> {
    validate(key, spec)?;

    let namespace =
        naming::workspace_namespace(&spec.owner, &key.name, &settings.namespace_prefix);
    if !naming::is_dns_label(&namespace) {
        return Err(ValidationError::InvalidNamespace(namespace));
    }

    let instance = naming::instance_label(key);
    let ctx = BuildContext {
        key,
        spec,
        settings,
        namespace: &namespace,
        instance: &instance,
    };

    let primary_port = spec.ports.first().copied();
    let host = primary_port.map(|_| format!("{namespace}.{}", settings.base_domain));

    let mut objects = vec![
        ProjectedObject::Namespace(ctx.namespace_object()),
        ProjectedObject::ResourceQuota(ctx.quota()),
        ProjectedObject::PersistentVolumeClaim(ctx.volume_claim()),
    ];
    if !spec.suspended {
        objects.push(ProjectedObject::Deployment(ctx.deployment()));
    }
    if let (Some(port), Some(host)) = (primary_port, host.as_deref()) {
        objects.push(ProjectedObject::Service(ctx.service()));
        objects.push(ProjectedObject::Ingress(ctx.ingress(host, port)));
    }

    for object in &mut objects {
        stamp(object);
    }

    Ok(ProjectionSet {
        namespace,
        instance,
        host,
        primary_port,
        objects,
    })
}

/// Hash of an object's canonical JSON.
pub fn content_hash(object: &ProjectedObject) -> String {
    // Typed API objects always serialize.
    let bytes = object
        .to_json()
        .and_then(|v| serde_json::to_vec(&v))
        .unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

fn stamp(object: &mut ProjectedObject) {
    let hash = content_hash(object);
    object
        .meta_mut()
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(PROJECTION_HASH.to_string(), hash);
}

struct BuildContext<'a> {
    key: &'a EnvironmentKey,
    spec: &'a DevEnvironmentSpec,
    settings: &'a ProjectionSettings,
    namespace: &'a str,
    instance: &'a str,
}

impl BuildContext<'_> {
    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
            (INSTANCE_LABEL.to_string(), self.instance.to_string()),
            (
                naming::OWNER_LABEL.to_string(),
                naming::label_value(&self.spec.owner),
            ),
        ])
    }

    fn selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(INSTANCE_LABEL.to_string(), self.instance.to_string())])
    }

    fn meta(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.to_string()),
            labels: Some(self.labels()),
            ..Default::default()
        }
    }

    fn limits(&self) -> (String, String, String) {
        let limits = self.spec.resource_limits.clone().unwrap_or_default();
        let quota = &self.settings.quota;
        (
            limits.cpu.unwrap_or_else(|| quota.cpu.clone()),
            limits.memory.unwrap_or_else(|| quota.memory.clone()),
            limits.storage.unwrap_or_else(|| quota.storage.clone()),
        )
    }

    fn namespace_object(&self) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(self.namespace.to_string()),
                labels: Some(self.labels()),
                annotations: Some(BTreeMap::from([(
                    ENVIRONMENT_ANNOTATION.to_string(),
                    self.key.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn quota(&self) -> ResourceQuota {
        let (cpu, memory, storage) = self.limits();
        ResourceQuota {
            metadata: self.meta(naming::QUOTA),
            spec: Some(ResourceQuotaSpec {
                hard: Some(BTreeMap::from([
                    ("limits.cpu".to_string(), Quantity(cpu)),
                    ("limits.memory".to_string(), Quantity(memory)),
                    ("requests.storage".to_string(), Quantity(storage)),
                    (
                        "pods".to_string(),
                        Quantity(self.settings.quota.pods.clone()),
                    ),
                ])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn volume_claim(&self) -> PersistentVolumeClaim {
        let size = self
            .spec
            .storage_size
            .clone()
            .unwrap_or_else(|| self.settings.default_storage_size.clone());
        PersistentVolumeClaim {
            metadata: self.meta(naming::VOLUME_CLAIM),
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: self.settings.storage_class.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([("storage".to_string(), Quantity(size))])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn env(&self) -> Vec<EnvVar> {
        let fixed = [
            ("KUBEDEV_OWNER", self.spec.owner.as_str()),
            ("KUBEDEV_ENVIRONMENT", self.key.name.as_str()),
        ];
        fixed
            .into_iter()
            .chain(self.spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .map(|(name, value)| EnvVar {
                name: name.to_string(),
                value: Some(value.to_string()),
                ..Default::default()
            })
            .collect()
    }

    fn resources(&self) -> ResourceRequirements {
        let (cpu, memory, _) = self.limits();
        ResourceRequirements {
            limits: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity(cpu)),
                ("memory".to_string(), Quantity(memory)),
            ])),
            ..Default::default()
        }
    }

    fn volume_mounts(&self) -> Vec<VolumeMount> {
        vec![VolumeMount {
            name: VOLUME_NAME.to_string(),
            mount_path: WORKSPACE_MOUNT.to_string(),
            ..Default::default()
        }]
    }

    fn shell(script: String) -> Option<Vec<String>> {
        Some(vec!["sh".to_string(), "-c".to_string(), script])
    }

    fn init_containers(&self) -> Vec<Container> {
        let mut containers = Vec::new();

        if let Some(repository) = &self.spec.git_repository {
            let git_ref = self
                .spec
                .git_ref
                .clone()
                .unwrap_or_else(|| DEFAULT_GIT_REF.to_string());
            containers.push(Container {
                name: GIT_CLONE_CONTAINER.to_string(),
                image: Some(self.settings.git_image.clone()),
                command: Self::shell(GIT_CLONE_SCRIPT.to_string()),
                env: Some(vec![
                    EnvVar {
                        name: "GIT_REPOSITORY".to_string(),
                        value: Some(repository.clone()),
                        ..Default::default()
                    },
                    EnvVar {
                        name: "GIT_REF".to_string(),
                        value: Some(git_ref),
                        ..Default::default()
                    },
                ]),
                resources: Some(self.resources()),
                volume_mounts: Some(self.volume_mounts()),
                ..Default::default()
            });
        }

        if !self.spec.init_commands.is_empty() {
            containers.push(Container {
                name: INIT_CONTAINER.to_string(),
                image: Some(self.spec.image.trim().to_string()),
                command: Self::shell(self.spec.init_commands.join(" && ")),
                env: Some(self.env()),
                resources: Some(self.resources()),
                volume_mounts: Some(self.volume_mounts()),
                working_dir: Some(WORKSPACE_MOUNT.to_string()),
                ..Default::default()
            });
        }

        containers
    }

    fn main_container(&self) -> Container {
        let ports: Vec<ContainerPort> = self
            .spec
            .ports
            .iter()
            .map(|&port| ContainerPort {
                name: Some(format!("port-{port}")),
                container_port: port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            })
            .collect();

        let readiness_probe = self.spec.ports.first().map(|&port| Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(port),
                ..Default::default()
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(10),
            ..Default::default()
        });

        Container {
            name: MAIN_CONTAINER.to_string(),
            image: Some(self.spec.image.trim().to_string()),
            command: self.spec.start_command.clone().and_then(Self::shell),
            ports: (!ports.is_empty()).then_some(ports),
            env: Some(self.env()),
            resources: Some(self.resources()),
            volume_mounts: Some(self.volume_mounts()),
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            readiness_probe,
            ..Default::default()
        }
    }

    fn deployment(&self) -> Deployment {
        let init_containers = self.init_containers();
        Deployment {
            metadata: self.meta(naming::WORKSPACE),
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(self.selector()),
                    ..Default::default()
                },
                strategy: Some(DeploymentStrategy {
                    type_: Some("Recreate".to_string()),
                    ..Default::default()
                }),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.labels()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        init_containers: (!init_containers.is_empty()).then_some(init_containers),
                        containers: vec![self.main_container()],
                        volumes: Some(vec![Volume {
                            name: VOLUME_NAME.to_string(),
                            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                claim_name: naming::VOLUME_CLAIM.to_string(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn service(&self) -> Service {
        Service {
            metadata: self.meta(naming::WORKSPACE),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(self.selector()),
                ports: Some(
                    self.spec
                        .ports
                        .iter()
                        .map(|&port| ServicePort {
                            name: Some(format!("port-{port}")),
                            port,
                            target_port: Some(IntOrString::Int(port)),
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn ingress(&self, host: &str, port: i32) -> Ingress {
        Ingress {
            metadata: self.meta(naming::WORKSPACE),
            spec: Some(IngressSpec {
                ingress_class_name: Some(self.settings.ingress_class.clone()),
                rules: Some(vec![IngressRule {
                    host: Some(host.to_string()),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some("/".to_string()),
                            path_type: "Prefix".to_string(),
                            backend: IngressBackend {
                                service: Some(IngressServiceBackend {
                                    name: naming::WORKSPACE.to_string(),
                                    port: Some(ServiceBackendPort {
                                        number: Some(port),
                                        ..Default::default()
                                    }),
                                }),
                                ..Default::default()
                            },
                        }],
                    }),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
