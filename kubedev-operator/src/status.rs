//! Status reporter: reconciliation results to user-visible status.

use crate::crd::{DevEnvironment, DevEnvironmentStatus, Phase};
use crate::error::ClientError;
use crate::retry::Clock;
use crate::store::EnvironmentStore;
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;

/// Where a running workspace can be reached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    /// External URL.
    pub access_url: Option<String>,
    /// Cluster IP of the service.
    pub internal_ip: Option<String>,
    /// Port the ingress routes to.
    pub external_port: Option<i32>,
}

/// What one reconciliation found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Resulting phase.
    pub phase: Phase,
    /// Human-readable detail.
    pub message: String,
    /// Workspace namespace, once derived.
    pub namespace: Option<String>,
    /// Endpoint, when serving.
    pub endpoint: Option<Endpoint>,
    /// Restart nonce that has been acted upon.
    pub restart_observed: Option<String>,
}

impl Observation {
    /// Observation with only phase and message.
    pub fn new(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            namespace: None,
            endpoint: None,
            restart_observed: None,
        }
    }

    /// Set the workspace namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set the endpoint.
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Record an acted-upon restart nonce.
    pub fn with_restart_observed(mut self, nonce: Option<String>) -> Self {
        self.restart_observed = nonce;
        self
    }
}

/// Next status given the previous one.
///
/// `lastTransitionTime` moves only when the phase changes. Endpoint fields
/// are kept while `Degraded` and cleared in every phase but `Running`.
pub fn next_status(
    previous: Option<&DevEnvironmentStatus>,
    observation: &Observation,
    generation: Option<i64>,
    now: DateTime<Utc>,
) -> DevEnvironmentStatus {
    let previous = previous.cloned().unwrap_or_default();
    let phase_changed = previous.phase != observation.phase;

    let last_transition_time = if phase_changed || previous.last_transition_time.is_none() {
        Some(now.to_rfc3339_opts(SecondsFormat::Secs, true))
    } else {
        previous.last_transition_time.clone()
    };

    let endpoint = match observation.phase {
        Phase::Running => observation.endpoint.clone().unwrap_or_default(),
        Phase::Degraded => observation.endpoint.clone().unwrap_or(Endpoint {
            access_url: previous.access_url.clone(),
            internal_ip: previous.internal_ip.clone(),
            external_port: previous.external_port,
        }),
        _ => Endpoint::default(),
    };

    DevEnvironmentStatus {
        phase: observation.phase,
        message: Some(observation.message.clone()),
        access_url: endpoint.access_url,
        internal_ip: endpoint.internal_ip,
        external_port: endpoint.external_port,
        observed_generation: generation,
        last_transition_time,
        namespace: observation.namespace.clone().or(previous.namespace),
        observed_restart_nonce: observation
            .restart_observed
            .clone()
            .or(previous.observed_restart_nonce),
    }
}

/// Writes statuses, skipping writes that would change nothing.
pub struct StatusReporter {
    store: Arc<dyn EnvironmentStore>,
    clock: Arc<dyn Clock>,
}

impl StatusReporter {
    /// Create a reporter.
    pub fn new(store: Arc<dyn EnvironmentStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Report `observation` for `env`. Returns whether a write happened.
    pub async fn report(
        &self,
        env: &DevEnvironment,
        observation: &Observation,
    ) -> Result<bool, ClientError> {
        let previous = env.status.as_ref();
        let next = next_status(
            previous,
            observation,
            env.metadata.generation,
            self.clock.now(),
        );
        if previous == Some(&next) {
            return Ok(false);
        }

        let from = env.phase();
        self.store.patch_status(&env.key(), &next).await?;

        if from != next.phase {
            tracing::info!(
                environment = %env.key(),
                from = %from,
                phase = %next.phase,
                message = %observation.message,
                "Phase transition"
            );
        } else {
            tracing::debug!(environment = %env.key(), phase = %next.phase, "Status updated");
        }
        Ok(true)
    }
}
