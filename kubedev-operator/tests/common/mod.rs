//! Shared helpers for the integration tests.

#![allow(dead_code)]

use kubedev_operator::client::ObjectKind;
use kubedev_operator::controller::ReconcileOutcome;
use kubedev_operator::crd::{DevEnvironmentSpec, EnvironmentKey};
use kubedev_operator::testing::{TestHarness, sample_spec};

/// Namespace of `sample_spec("u1")` named `env1`.
pub const NAMESPACE: &str = "ws-u1-env1";

pub async fn reconcile(h: &TestHarness, key: &EnvironmentKey) -> ReconcileOutcome {
    h.reconciler.reconcile(key).await.expect("reconcile")
}

/// Create `kubedev/env1` for owner `u1`.
pub fn create_env(h: &TestHarness) -> EnvironmentKey {
    h.store.create("kubedev", "env1", sample_spec("u1"))
}

pub fn create_env_with(h: &TestHarness, spec: DevEnvironmentSpec) -> EnvironmentKey {
    h.store.create("kubedev", "env1", spec)
}

/// Reconcile, mark the deployment ready and reconcile again.
pub async fn bring_up(h: &TestHarness, key: &EnvironmentKey) {
    reconcile(h, key).await;
    assert!(h.cluster.set_ready_replicas(NAMESPACE, "workspace", 1));
    reconcile(h, key).await;
}

pub fn kinds_present(h: &TestHarness) -> Vec<ObjectKind> {
    ObjectKind::APPLY_ORDER
        .into_iter()
        .filter(|&kind| {
            let name = match kind {
                ObjectKind::Namespace => NAMESPACE,
                ObjectKind::ResourceQuota => "workspace-quota",
                ObjectKind::PersistentVolumeClaim => "workspace-data",
                _ => "workspace",
            };
            h.cluster.contains(kind, NAMESPACE, name)
        })
        .collect()
}
