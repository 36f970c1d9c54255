//! Integration tests for deletion, teardown and orphan cleanup.

mod common;

use common::{NAMESPACE, bring_up, create_env, reconcile};
use kubedev_operator::actions::EnvironmentActions;
use kubedev_operator::builder;
use kubedev_operator::client::ObjectKind;
use kubedev_operator::config::ProjectionSettings;
use kubedev_operator::controller::ReconcileOutcome;
use kubedev_operator::crd::{EnvironmentKey, Phase};
use kubedev_operator::error::ClientError;
use kubedev_operator::naming::{self, INSTANCE_LABEL};
use kubedev_operator::queue::ReconcileReason;
use kubedev_operator::store::EnvironmentStore;
use kubedev_operator::testing::{TestHarness, Verb, sample_spec};
use kubedev_operator::watcher::Resyncer;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn delete_removes_every_labeled_object_then_the_resource() {
    let h = TestHarness::new();
    let key = create_env(&h);
    bring_up(&h, &key).await;
    let instance = naming::instance_label(&key);
    assert_eq!(h.cluster.labeled(INSTANCE_LABEL, &instance).len(), 6);

    let actions = EnvironmentActions::new(h.store.clone(), h.clock.clone());
    actions.delete(&key).await.expect("delete");
    let env = h.store.env(&key).expect("held by finalizer");
    assert!(env.is_deleting());

    let outcome = reconcile(&h, &key).await;

    assert_eq!(outcome, ReconcileOutcome::Terminated);
    assert!(h.cluster.labeled(INSTANCE_LABEL, &instance).is_empty());
    assert!(h.store.env(&key).is_none());
}

#[tokio::test]
async fn teardown_reports_terminating_first() {
    let h = TestHarness::new();
    let key = create_env(&h);
    bring_up(&h, &key).await;
    h.cluster.fail_next(
        Verb::Delete,
        ObjectKind::Ingress,
        ClientError::Forbidden("ingresses are forbidden".to_string()),
        1,
    );

    h.store.delete(&key).await.expect("delete");
    h.reconciler.reconcile(&key).await.expect_err("forbidden");

    assert_eq!(h.store.phase(&key), Some(Phase::Terminating));
    assert!(h.cluster.contains(ObjectKind::Namespace, NAMESPACE, NAMESPACE));

    // The next attempt finishes the job.
    assert_eq!(reconcile(&h, &key).await, ReconcileOutcome::Terminated);
    assert!(h.store.env(&key).is_none());
    assert!(h.cluster.is_empty());
}

#[tokio::test]
async fn teardown_order_is_reverse_of_creation() {
    let h = TestHarness::new();
    let key = create_env(&h);
    bring_up(&h, &key).await;
    h.store.delete(&key).await.expect("delete");
    h.cluster.clear_calls();

    reconcile(&h, &key).await;

    let deleted: Vec<_> = h
        .cluster
        .mutating_calls()
        .into_iter()
        .map(|c| c.kind)
        .collect();
    let mut expected = ObjectKind::APPLY_ORDER.to_vec();
    expected.reverse();
    assert_eq!(deleted, expected);
}

#[tokio::test]
async fn deleting_an_unprovisioned_environment_is_immediate() {
    let h = TestHarness::new();
    let key = create_env(&h);
    h.store.delete(&key).await.expect("delete");
    assert!(h.store.env(&key).is_none());

    // A stray request for the vanished key is harmless.
    assert_eq!(reconcile(&h, &key).await, ReconcileOutcome::Terminated);
    assert!(h.cluster.mutating_calls().is_empty());
}

#[tokio::test]
async fn missing_resource_with_leftover_objects_is_cleaned_up() {
    let h = TestHarness::new();
    let key = EnvironmentKey::new("kubedev", "gone");
    let leftover =
        builder::build(&key, &sample_spec("u9"), &ProjectionSettings::default()).expect("build");
    for object in leftover.objects() {
        h.cluster.insert(object.clone());
    }

    assert_eq!(reconcile(&h, &key).await, ReconcileOutcome::Terminated);
    assert!(h.cluster.is_empty());
}

#[tokio::test]
async fn resync_enqueues_live_and_orphaned_environments() {
    let h = TestHarness::new();
    let live = create_env(&h);
    reconcile(&h, &live).await;

    let orphan = EnvironmentKey::new("kubedev", "orphan");
    let leftover = builder::build(&orphan, &sample_spec("u2"), &ProjectionSettings::default())
        .expect("build");
    for object in leftover.objects() {
        h.cluster.insert(object.clone());
    }

    let resyncer = Resyncer::new(
        h.store.clone(),
        Arc::new(h.cluster.clone()),
        h.queue.clone(),
        Duration::from_secs(300),
        None,
    );
    assert_eq!(resyncer.resync_once().await.expect("resync"), 2);

    let mut requests = HashSet::new();
    while let Some(request) = h.queue.try_next() {
        requests.insert((request.key.clone(), request.reason));
        h.queue.done(&request.key);
    }
    assert!(requests.contains(&(live, ReconcileReason::Resynced)));
    assert!(requests.contains(&(orphan.clone(), ReconcileReason::Deleted)));

    reconcile(&h, &orphan).await;
    let instance = naming::instance_label(&orphan);
    assert!(h.cluster.labeled(INSTANCE_LABEL, &instance).is_empty());
}

#[tokio::test]
async fn resync_ignores_orphans_outside_the_watched_namespace() {
    let h = TestHarness::new();
    let orphan = EnvironmentKey::new("elsewhere", "orphan");
    let leftover = builder::build(&orphan, &sample_spec("u2"), &ProjectionSettings::default())
        .expect("build");
    for object in leftover.objects() {
        h.cluster.insert(object.clone());
    }

    let resyncer = Resyncer::new(
        h.store.clone(),
        Arc::new(h.cluster.clone()),
        h.queue.clone(),
        Duration::from_secs(300),
        Some("kubedev".to_string()),
    );
    assert_eq!(resyncer.resync_once().await.expect("resync"), 0);
    assert!(h.queue.is_empty());
}
