//! DevEnvironment Custom Resource Definition.
//!
//! Declares one user's development workspace. The REST backend writes these
//! objects into a control namespace; the operator owns the `status`.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Finalizer held on every live DevEnvironment until its projection is torn down.
pub const FINALIZER: &str = "kubedev.io/teardown";

/// DevEnvironment is the Schema for the devenvironments API.
///
/// The operator derives a dedicated namespace from `owner` and the object
/// name, then creates the workspace objects inside it.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubedev.io",
    version = "v1",
    kind = "DevEnvironment",
    plural = "devenvironments",
    shortname = "devenv",
    namespaced,
    status = "DevEnvironmentStatus",
    printcolumn = r#"{"name":"Owner", "type":"string", "jsonPath":".spec.owner"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"URL", "type":"string", "jsonPath":".status.accessURL"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DevEnvironmentSpec {
    /// Identity of the requesting user.
    pub owner: String,

    /// Git repository cloned into `/workspace` on first start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_repository: Option<String>,

    /// Branch or tag to clone. Defaults to `main` when a repository is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,

    /// Base image for the IDE/runtime container.
    pub image: String,

    /// Shell snippets run once per pod start, before the workspace starts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_commands: Vec<String>,

    /// Shell snippet started as the workspace's main process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_command: Option<String>,

    /// Container ports to expose, in order. The first one backs the ingress.
    #[serde(default)]
    pub ports: Vec<i32>,

    /// Quota for the workspace namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_limits: Option<ResourceLimits>,

    /// Persistent volume size (e.g. "5Gi").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_size: Option<String>,

    /// Extra environment variables for the workspace containers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Stopped environments keep their storage but run no pods.
    #[serde(default)]
    pub suspended: bool,

    /// Changing this value restarts the workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_nonce: Option<String>,
}

/// CPU, memory and storage quota.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// CPU (e.g., "2", "500m").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory (e.g., "4Gi").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    /// Total storage requests in the namespace (e.g., "20Gi").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
}

/// DevEnvironment status. Written only by the operator.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DevEnvironmentStatus {
    /// Coarse lifecycle state.
    #[serde(default)]
    pub phase: Phase,

    /// Latest human-readable condition detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// URL the workspace is served on once reachable.
    #[serde(default, rename = "accessURL", skip_serializing_if = "Option::is_none")]
    pub access_url: Option<String>,

    /// Cluster IP of the workspace service.
    #[serde(default, rename = "internalIP", skip_serializing_if = "Option::is_none")]
    pub internal_ip: Option<String>,

    /// Service port the ingress routes to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_port: Option<i32>,

    /// Spec generation this status reflects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Last time `phase` changed (RFC 3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// Workspace namespace derived from the environment identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Last `restartNonce` that has been acted upon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_restart_nonce: Option<String>,
}

/// Environment phase.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Accepted, nothing created yet.
    #[default]
    Pending,
    /// Projection is being created or is not ready yet.
    Provisioning,
    /// Workspace is ready and serving.
    Running,
    /// Was running, readiness lost without a stop.
    Degraded,
    /// Stopped by the user; storage retained.
    Stopped,
    /// Projection is being torn down.
    Terminating,
    /// Terminal error; waits for a spec change.
    Failed,
}

impl Phase {
    /// Phases in which readiness loss means `Degraded` rather than `Provisioning`.
    pub fn was_serving(self) -> bool {
        matches!(self, Phase::Running | Phase::Degraded)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Provisioning => "Provisioning",
            Phase::Running => "Running",
            Phase::Degraded => "Degraded",
            Phase::Stopped => "Stopped",
            Phase::Terminating => "Terminating",
            Phase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Reference to a DevEnvironment object; the unit of work in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvironmentKey {
    /// Namespace holding the DevEnvironment object.
    pub namespace: String,
    /// DevEnvironment object name (the environment name).
    pub name: String,
}

impl EnvironmentKey {
    /// Create a key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for EnvironmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl DevEnvironment {
    /// Queue key for this object.
    pub fn key(&self) -> EnvironmentKey {
        EnvironmentKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Current phase, `Pending` when no status has been written yet.
    pub fn phase(&self) -> Phase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Whether deletion has been requested.
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the teardown finalizer is present.
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == FINALIZER)
    }

    /// Restart nonce that still needs to be acted upon, if any.
    pub fn pending_restart(&self) -> Option<&str> {
        let requested = self.spec.restart_nonce.as_deref()?;
        let observed = self
            .status
            .as_ref()
            .and_then(|s| s.observed_restart_nonce.as_deref());
        (observed != Some(requested)).then_some(requested)
    }
}
