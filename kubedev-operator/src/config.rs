//! Operator configuration.
//!
//! Defaults are production values. [`OperatorConfig::from_env`] reads
//! `KUBEDEV_*` variables; the binary's flags override both.

use crate::error::{OperatorError, OperatorResult};
use crate::naming;
use crate::retry::BackoffPolicy;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default quota applied to every workspace namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaDefaults {
    /// `limits.cpu` when the spec sets none.
    pub cpu: String,
    /// `limits.memory` when the spec sets none.
    pub memory: String,
    /// `requests.storage` when the spec sets none.
    pub storage: String,
    /// Maximum pods in the namespace.
    pub pods: String,
}

impl Default for QuotaDefaults {
    fn default() -> Self {
        Self {
            cpu: "1000m".to_string(),
            memory: "2Gi".to_string(),
            storage: "10Gi".to_string(),
            pods: "5".to_string(),
        }
    }
}

/// Settings the resource builder needs besides the spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionSettings {
    /// Prefix of every workspace namespace.
    pub namespace_prefix: String,
    /// Ingress hosts are `<namespace>.<base_domain>`.
    pub base_domain: String,
    /// Ingress class name.
    pub ingress_class: String,
    /// Image of the `git-clone` init container.
    pub git_image: String,
    /// Storage class for the workspace volume; cluster default when unset.
    pub storage_class: Option<String>,
    /// Volume size when the spec sets none.
    pub default_storage_size: String,
    /// Quota defaults.
    pub quota: QuotaDefaults,
}

impl Default for ProjectionSettings {
    fn default() -> Self {
        Self {
            namespace_prefix: "ws".to_string(),
            base_domain: "kubedev.local".to_string(),
            ingress_class: "nginx".to_string(),
            git_image: "alpine/git:2.45.2".to_string(),
            storage_class: None,
            default_storage_size: "5Gi".to_string(),
            quota: QuotaDefaults::default(),
        }
    }
}

/// Configuration for the operator process.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Concurrent reconciliation workers.
    pub workers: usize,
    /// Full re-enqueue period.
    pub resync_interval: Duration,
    /// Soft deadline of one reconciliation attempt.
    pub reconcile_deadline: Duration,
    /// Timeout of a single cluster API request.
    pub request_timeout: Duration,
    /// Namespace holding DevEnvironment objects; all namespaces when unset.
    pub watch_namespace: Option<String>,
    /// Requeue delay while something is in progress.
    pub requeue_short: Duration,
    /// Requeue delay for settled environments.
    pub requeue_long: Duration,
    /// Per-call retry policy of the cluster client.
    pub client_retry: BackoffPolicy,
    /// Backoff between failed reconciliations of the same environment.
    pub requeue_backoff: BackoffPolicy,
    /// Resource builder settings.
    pub projection: ProjectionSettings,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_interval: Duration::from_secs(300),
            reconcile_deadline: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            watch_namespace: None,
            requeue_short: Duration::from_secs(5),
            requeue_long: Duration::from_secs(300),
            client_retry: BackoffPolicy::default(),
            requeue_backoff: BackoffPolicy::requeue(),
            projection: ProjectionSettings::default(),
        }
    }
}

fn parse_var<T: FromStr>(name: &str) -> OperatorResult<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| OperatorError::InvalidConfig(format!("{name}={raw:?} is not valid"))),
        Err(_) => Ok(None),
    }
}

fn string_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl OperatorConfig {
    /// Create a new configuration builder.
    pub fn builder() -> OperatorConfigBuilder {
        OperatorConfigBuilder::default()
    }

    /// Create configuration from environment variables.
    ///
    /// Environment variables:
    /// - `KUBEDEV_WORKERS`: number of reconciliation workers
    /// - `KUBEDEV_RESYNC_INTERVAL_SECS`: full resync period
    /// - `KUBEDEV_RECONCILE_DEADLINE_SECS`: soft deadline per attempt
    /// - `KUBEDEV_WATCH_NAMESPACE`: namespace holding DevEnvironments
    /// - `KUBEDEV_NAMESPACE_PREFIX`, `KUBEDEV_BASE_DOMAIN`, `KUBEDEV_INGRESS_CLASS`
    /// - `KUBEDEV_GIT_IMAGE`, `KUBEDEV_STORAGE_CLASS`, `KUBEDEV_DEFAULT_STORAGE_SIZE`
    /// - `KUBEDEV_DEFAULT_CPU`, `KUBEDEV_DEFAULT_MEMORY`, `KUBEDEV_DEFAULT_STORAGE`,
    ///   `KUBEDEV_MAX_PODS`: quota defaults
    pub fn from_env() -> OperatorResult<Self> {
        let mut builder = Self::builder();

        if let Some(workers) = parse_var::<usize>("KUBEDEV_WORKERS")? {
            builder = builder.workers(workers);
        }
        if let Some(secs) = parse_var::<u64>("KUBEDEV_RESYNC_INTERVAL_SECS")? {
            builder = builder.resync_interval(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var::<u64>("KUBEDEV_RECONCILE_DEADLINE_SECS")? {
            builder = builder.reconcile_deadline(Duration::from_secs(secs));
        }
        if let Some(ns) = string_var("KUBEDEV_WATCH_NAMESPACE") {
            builder = builder.watch_namespace(ns);
        }
        if let Some(prefix) = string_var("KUBEDEV_NAMESPACE_PREFIX") {
            builder = builder.namespace_prefix(prefix);
        }
        if let Some(domain) = string_var("KUBEDEV_BASE_DOMAIN") {
            builder = builder.base_domain(domain);
        }
        if let Some(class) = string_var("KUBEDEV_INGRESS_CLASS") {
            builder = builder.ingress_class(class);
        }
        if let Some(image) = string_var("KUBEDEV_GIT_IMAGE") {
            builder = builder.git_image(image);
        }
        if let Some(class) = string_var("KUBEDEV_STORAGE_CLASS") {
            builder = builder.storage_class(class);
        }
        if let Some(size) = string_var("KUBEDEV_DEFAULT_STORAGE_SIZE") {
            builder.config.projection.default_storage_size = size;
        }
        if let Some(cpu) = string_var("KUBEDEV_DEFAULT_CPU") {
            builder.config.projection.quota.cpu = cpu;
        }
        if let Some(memory) = string_var("KUBEDEV_DEFAULT_MEMORY") {
            builder.config.projection.quota.memory = memory;
        }
        if let Some(storage) = string_var("KUBEDEV_DEFAULT_STORAGE") {
            builder.config.projection.quota.storage = storage;
        }
        if let Some(pods) = parse_var::<u32>("KUBEDEV_MAX_PODS")? {
            builder.config.projection.quota.pods = pods.to_string();
        }

        builder.build()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> OperatorResult<()> {
        if self.workers == 0 {
            return Err(OperatorError::InvalidConfig("workers must be > 0".into()));
        }
        if self.reconcile_deadline.is_zero() {
            return Err(OperatorError::InvalidConfig(
                "reconcile deadline must be > 0".into(),
            ));
        }
        if self.resync_interval.is_zero() {
            return Err(OperatorError::InvalidConfig(
                "resync interval must be > 0".into(),
            ));
        }
        let prefix = &self.projection.namespace_prefix;
        if !naming::is_dns_label(prefix) || prefix.len() > 20 {
            return Err(OperatorError::InvalidConfig(format!(
                "namespace prefix {prefix:?} must be a DNS label of at most 20 characters"
            )));
        }
        if !naming::is_dns_subdomain(&self.projection.base_domain) {
            return Err(OperatorError::InvalidConfig(format!(
                "base domain {:?} is not a DNS name",
                self.projection.base_domain
            )));
        }
        if self.client_retry.max_attempts == 0 {
            return Err(OperatorError::InvalidConfig(
                "client retry needs at least one attempt".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for OperatorConfig.
#[derive(Debug, Default)]
pub struct OperatorConfigBuilder {
    config: OperatorConfig,
}

impl OperatorConfigBuilder {
    /// Set the number of workers.
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Set the resync interval.
    pub fn resync_interval(mut self, interval: Duration) -> Self {
        self.config.resync_interval = interval;
        self
    }

    /// Set the reconciliation deadline.
    pub fn reconcile_deadline(mut self, deadline: Duration) -> Self {
        self.config.reconcile_deadline = deadline;
        self
    }

    /// Set the per-request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Restrict watching to one namespace.
    pub fn watch_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.watch_namespace = Some(namespace.into());
        self
    }

    /// Set the workspace namespace prefix.
    pub fn namespace_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.projection.namespace_prefix = prefix.into();
        self
    }

    /// Set the ingress base domain.
    pub fn base_domain(mut self, domain: impl Into<String>) -> Self {
        self.config.projection.base_domain = domain.into();
        self
    }

    /// Set the ingress class.
    pub fn ingress_class(mut self, class: impl Into<String>) -> Self {
        self.config.projection.ingress_class = class.into();
        self
    }

    /// Set the git clone image.
    pub fn git_image(mut self, image: impl Into<String>) -> Self {
        self.config.projection.git_image = image.into();
        self
    }

    /// Set the storage class.
    pub fn storage_class(mut self, class: impl Into<String>) -> Self {
        self.config.projection.storage_class = Some(class.into());
        self
    }

    /// Set the cluster client retry policy.
    pub fn client_retry(mut self, policy: BackoffPolicy) -> Self {
        self.config.client_retry = policy;
        self
    }

    /// Set the reconciliation requeue backoff.
    pub fn requeue_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.config.requeue_backoff = policy;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> OperatorResult<OperatorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = OperatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.workers, 4);
        assert_eq!(config.resync_interval, Duration::from_secs(300));
        assert_eq!(config.projection.base_domain, "kubedev.local");
    }

    #[test]
    fn builder_rejects_zero_workers() {
        assert!(OperatorConfig::builder().workers(0).build().is_err());
    }

    #[test]
    fn builder_rejects_bad_prefix() {
        assert!(
            OperatorConfig::builder()
                .namespace_prefix("Not_A_Label")
                .build()
                .is_err()
        );
        assert!(
            OperatorConfig::builder()
                .namespace_prefix("dev")
                .build()
                .is_ok()
        );
    }
}
