//! Reconciler core for DevEnvironment resources.
//!
//! - [`Reconciler`]: converges one environment per call
//! - [`ObservedProjection`]: the live objects seen during that call
//!
//! # Usage
//!
//! ```ignore
//! let ctx = Arc::new(ControllerContext::new(client, store, clock, config));
//! let reconciler = Reconciler::new(ctx);
//! match reconciler.reconcile(&key).await? {
//!     ReconcileOutcome::Requeue(after) => queue.enqueue_after(key, ReconcileReason::Resynced, after),
//!     ReconcileOutcome::Await | ReconcileOutcome::Terminated => {}
//! }
//! ```

mod observed;
mod reconciler;

pub use observed::{
    ObservedProjection, cluster_ip, deployment_ready, namespace_terminating, needs_update,
};
pub use reconciler::Reconciler;

use crate::client::ClusterClient;
use crate::config::OperatorConfig;
use crate::crd::Phase;
use crate::retry::Clock;
use crate::status::StatusReporter;
use crate::store::EnvironmentStore;
use std::sync::Arc;
use std::time::Duration;

/// Shared context for reconciliation workers.
pub struct ControllerContext {
    /// Cluster client, usually a [`crate::client::RetryingClient`].
    pub client: Arc<dyn ClusterClient>,
    /// DevEnvironment store.
    pub store: Arc<dyn EnvironmentStore>,
    /// Status writer.
    pub reporter: StatusReporter,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Operator configuration.
    pub config: OperatorConfig,
}

impl ControllerContext {
    /// Create a new controller context.
    pub fn new(
        client: Arc<dyn ClusterClient>,
        store: Arc<dyn EnvironmentStore>,
        clock: Arc<dyn Clock>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            reporter: StatusReporter::new(Arc::clone(&store), Arc::clone(&clock)),
            client,
            store,
            clock,
            config,
        }
    }
}

/// Result of a reconciliation that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Look again after the specified duration.
    Requeue(Duration),
    /// Nothing to do until the spec changes or a resync happens.
    Await,
    /// The environment and its projection are gone.
    Terminated,
}

impl ReconcileOutcome {
    /// Requeue cadence for an environment that settled in `phase`.
    pub fn for_phase(phase: Phase, config: &OperatorConfig) -> Self {
        match phase {
            Phase::Pending | Phase::Provisioning | Phase::Degraded | Phase::Terminating => {
                Self::Requeue(config.requeue_short)
            }
            Phase::Running | Phase::Stopped => Self::Requeue(config.requeue_long),
            Phase::Failed => Self::Await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requeue_cadence_follows_phase() {
        let config = OperatorConfig::default();
        assert_eq!(
            ReconcileOutcome::for_phase(Phase::Provisioning, &config),
            ReconcileOutcome::Requeue(Duration::from_secs(5))
        );
        assert_eq!(
            ReconcileOutcome::for_phase(Phase::Running, &config),
            ReconcileOutcome::Requeue(Duration::from_secs(300))
        );
        assert_eq!(
            ReconcileOutcome::for_phase(Phase::Failed, &config),
            ReconcileOutcome::Await
        );
    }
}
