//! Integration tests for the DevEnvironment lifecycle against a fake cluster.

mod common;

use common::{NAMESPACE, bring_up, create_env, create_env_with, kinds_present, reconcile};
use kubedev_operator::actions::EnvironmentActions;
use kubedev_operator::builder;
use kubedev_operator::client::{ClusterClient, ObjectKind, ProjectedObject};
use kubedev_operator::config::ProjectionSettings;
use kubedev_operator::controller::ReconcileOutcome;
use kubedev_operator::crd::Phase;
use kubedev_operator::error::ClientError;
use kubedev_operator::queue::{ReconcileReason, Request};
use kubedev_operator::testing::{TestHarness, Verb, sample_spec};
use std::time::Duration;

#[tokio::test]
async fn new_environment_is_provisioned_then_running() {
    let h = TestHarness::new();
    let key = create_env(&h);
    assert_eq!(h.store.phase(&key), Some(Phase::Pending));

    let outcome = reconcile(&h, &key).await;
    assert_eq!(outcome, ReconcileOutcome::Requeue(Duration::from_secs(5)));
    assert_eq!(h.store.phase(&key), Some(Phase::Provisioning));
    assert_eq!(kinds_present(&h), ObjectKind::APPLY_ORDER.to_vec());

    let env = h.store.env(&key).expect("env");
    assert!(env.has_finalizer());
    let status = env.status.expect("status");
    assert_eq!(status.namespace.as_deref(), Some(NAMESPACE));
    assert_eq!(status.observed_generation, Some(1));
    assert!(status.access_url.is_none());

    assert!(h.cluster.set_ready_replicas(NAMESPACE, "workspace", 1));
    let outcome = reconcile(&h, &key).await;
    assert_eq!(outcome, ReconcileOutcome::Requeue(Duration::from_secs(300)));

    let status = h.store.status(&key).expect("status");
    assert_eq!(status.phase, Phase::Running);
    assert_eq!(
        status.access_url.as_deref(),
        Some("http://ws-u1-env1.kubedev.local")
    );
    assert_eq!(status.internal_ip.as_deref(), Some("10.96.0.1"));
    assert_eq!(status.external_port, Some(8080));
}

#[tokio::test]
async fn second_reconcile_changes_nothing() {
    let h = TestHarness::new();
    let key = create_env(&h);
    bring_up(&h, &key).await;

    let writes = h.store.status_writes();
    let before = h.store.status(&key);
    h.cluster.clear_calls();

    reconcile(&h, &key).await;

    assert!(h.cluster.mutating_calls().is_empty());
    assert_eq!(h.store.status_writes(), writes);
    assert_eq!(h.store.status(&key), before);
}

#[tokio::test]
async fn invalid_port_fails_without_retry() {
    let h = TestHarness::new();
    let mut spec = sample_spec("u1");
    spec.ports = vec![70000];
    let key = create_env_with(&h, spec);

    h.pool()
        .process(Request {
            key: key.clone(),
            reason: ReconcileReason::Added,
        })
        .await;

    let status = h.store.status(&key).expect("status");
    assert_eq!(status.phase, Phase::Failed);
    assert!(status.message.expect("message").contains("70000"));
    assert_eq!(h.queue.failures(&key), 0);
    assert!(h.queue.is_empty());
    assert!(h.cluster.mutating_calls().is_empty());
    assert!(h.cluster.is_empty());
}

#[tokio::test]
async fn fixing_the_spec_recovers_from_failed() {
    let h = TestHarness::new();
    let mut spec = sample_spec("u1");
    spec.image = "Not A Valid Image".to_string();
    let key = create_env_with(&h, spec);

    assert_eq!(reconcile(&h, &key).await, ReconcileOutcome::Await);
    assert_eq!(h.store.phase(&key), Some(Phase::Failed));

    h.store
        .update_spec(&key, |spec| spec.image = "base:latest".to_string());
    reconcile(&h, &key).await;
    assert_eq!(h.store.phase(&key), Some(Phase::Provisioning));
    assert_eq!(h.store.status(&key).and_then(|s| s.observed_generation), Some(2));
}

#[tokio::test]
async fn transient_create_failure_is_retried_within_the_call() {
    let h = TestHarness::new();
    let key = create_env(&h);
    h.cluster.fail_next(
        Verb::Create,
        ObjectKind::Deployment,
        ClientError::Timeout("deadline exceeded".to_string()),
        2,
    );

    reconcile(&h, &key).await;

    assert_eq!(h.store.phase(&key), Some(Phase::Provisioning));
    assert!(h.cluster.contains(ObjectKind::Deployment, NAMESPACE, "workspace"));
    assert_eq!(h.cluster.count(Verb::Create, ObjectKind::Deployment), 3);
    assert_eq!(
        h.clock.sleeps(),
        vec![Duration::from_millis(200), Duration::from_millis(400)]
    );
}

#[tokio::test]
async fn exhausted_retries_requeue_with_backoff() {
    let h = TestHarness::new();
    let key = create_env(&h);
    h.cluster.fail_next(
        Verb::Create,
        ObjectKind::Service,
        ClientError::Unavailable("apiserver overloaded".to_string()),
        10,
    );

    h.pool()
        .process(Request {
            key: key.clone(),
            reason: ReconcileReason::Added,
        })
        .await;

    assert_eq!(h.queue.failures(&key), 1);
    let status = h.store.status(&key).expect("status");
    assert_eq!(status.phase, Phase::Provisioning);
    assert!(status.message.expect("message").starts_with("Retrying:"));
    // Objects before the service in apply order were created.
    assert!(h.cluster.contains(ObjectKind::Deployment, NAMESPACE, "workspace"));
    assert!(!h.cluster.contains(ObjectKind::Ingress, NAMESPACE, "workspace"));
}

#[tokio::test]
async fn forbidden_is_not_retried_by_the_client() {
    let h = TestHarness::new();
    let key = create_env(&h);
    h.cluster.fail_next(
        Verb::Create,
        ObjectKind::ResourceQuota,
        ClientError::Forbidden("quotas are forbidden".to_string()),
        1,
    );

    let err = h.reconciler.reconcile(&key).await.expect_err("forbidden");
    assert!(!err.is_terminal());
    assert_eq!(h.cluster.count(Verb::Create, ObjectKind::ResourceQuota), 1);
    assert!(h.clock.sleeps().is_empty());
}

#[tokio::test]
async fn restart_recreates_only_the_deployment() {
    let h = TestHarness::new();
    let key = create_env(&h);
    bring_up(&h, &key).await;
    let actions = EnvironmentActions::new(h.store.clone(), h.clock.clone());

    let nonce = actions.restart(&key).await.expect("restart");
    h.cluster.clear_calls();
    reconcile(&h, &key).await;

    let mutations: Vec<_> = h
        .cluster
        .mutating_calls()
        .into_iter()
        .map(|c| (c.verb, c.kind))
        .collect();
    assert_eq!(
        mutations,
        vec![
            (Verb::Delete, ObjectKind::Deployment),
            (Verb::Create, ObjectKind::Deployment),
        ]
    );
    let status = h.store.status(&key).expect("status");
    assert_eq!(status.phase, Phase::Provisioning);
    assert_eq!(status.observed_restart_nonce.as_deref(), Some(nonce.as_str()));

    // The nonce is acted upon once.
    h.cluster.set_ready_replicas(NAMESPACE, "workspace", 1);
    h.cluster.clear_calls();
    reconcile(&h, &key).await;
    assert!(h.cluster.mutating_calls().is_empty());
    assert_eq!(h.store.phase(&key), Some(Phase::Running));
}

#[tokio::test]
async fn stop_keeps_storage_and_start_brings_it_back() {
    let h = TestHarness::new();
    let key = create_env(&h);
    bring_up(&h, &key).await;
    let actions = EnvironmentActions::new(h.store.clone(), h.clock.clone());

    actions.stop(&key).await.expect("stop");
    let outcome = reconcile(&h, &key).await;
    assert_eq!(outcome, ReconcileOutcome::Requeue(Duration::from_secs(300)));

    let status = h.store.status(&key).expect("status");
    assert_eq!(status.phase, Phase::Stopped);
    assert!(status.access_url.is_none());
    assert!(!h.cluster.contains(ObjectKind::Deployment, NAMESPACE, "workspace"));
    assert!(h.cluster.contains(ObjectKind::PersistentVolumeClaim, NAMESPACE, "workspace-data"));

    actions.start(&key).await.expect("start");
    reconcile(&h, &key).await;
    assert_eq!(h.store.phase(&key), Some(Phase::Provisioning));
    assert!(h.cluster.contains(ObjectKind::Deployment, NAMESPACE, "workspace"));
}

#[tokio::test]
async fn restart_of_stopped_environment_provisions_it() {
    let h = TestHarness::new();
    let key = create_env(&h);
    bring_up(&h, &key).await;
    let actions = EnvironmentActions::new(h.store.clone(), h.clock.clone());

    actions.stop(&key).await.expect("stop");
    reconcile(&h, &key).await;
    assert_eq!(h.store.phase(&key), Some(Phase::Stopped));

    let nonce = actions.restart(&key).await.expect("restart");
    let env = h.store.env(&key).expect("env");
    assert!(!env.spec.suspended);
    reconcile(&h, &key).await;

    let status = h.store.status(&key).expect("status");
    assert_eq!(status.phase, Phase::Provisioning);
    assert!(status.access_url.is_none());
    assert_eq!(status.observed_restart_nonce.as_deref(), Some(nonce.as_str()));
    assert!(h.cluster.contains(ObjectKind::Deployment, NAMESPACE, "workspace"));
}

#[tokio::test]
async fn out_of_band_edits_are_reverted() {
    let h = TestHarness::new();
    let key = create_env(&h);
    bring_up(&h, &key).await;

    h.cluster
        .edit(ObjectKind::Deployment, NAMESPACE, "workspace", |object| {
            if let ProjectedObject::Deployment(d) = object {
                if let Some(spec) = d.spec.as_mut() {
                    spec.replicas = Some(3);
                }
            }
        });
    h.cluster.clear_calls();
    reconcile(&h, &key).await;

    let mutations = h.cluster.mutating_calls();
    assert_eq!(mutations.len(), 1);
    assert_eq!(mutations[0].verb, Verb::Update);
    assert_eq!(mutations[0].kind, ObjectKind::Deployment);
    let Some(ProjectedObject::Deployment(d)) =
        h.cluster.object(ObjectKind::Deployment, NAMESPACE, "workspace")
    else {
        panic!("deployment exists");
    };
    assert_eq!(d.spec.and_then(|s| s.replicas), Some(1));
    // Readiness survives the update.
    assert_eq!(h.store.phase(&key), Some(Phase::Running));
}

#[tokio::test]
async fn removed_port_removes_service_and_ingress() {
    let h = TestHarness::new();
    let key = create_env(&h);
    bring_up(&h, &key).await;

    h.store.update_spec(&key, |spec| spec.ports.clear());
    reconcile(&h, &key).await;

    assert!(!h.cluster.contains(ObjectKind::Service, NAMESPACE, "workspace"));
    assert!(!h.cluster.contains(ObjectKind::Ingress, NAMESPACE, "workspace"));
    let status = h.store.status(&key).expect("status");
    assert_eq!(status.phase, Phase::Running);
    assert!(status.access_url.is_none());
}

#[tokio::test]
async fn lost_readiness_is_degraded() {
    let h = TestHarness::new();
    let key = create_env(&h);
    bring_up(&h, &key).await;

    h.cluster.set_ready_replicas(NAMESPACE, "workspace", 0);
    let outcome = reconcile(&h, &key).await;

    assert_eq!(outcome, ReconcileOutcome::Requeue(Duration::from_secs(5)));
    let status = h.store.status(&key).expect("status");
    assert_eq!(status.phase, Phase::Degraded);
    assert!(status.access_url.is_some());
}

#[tokio::test]
async fn deleted_deployment_while_running_is_degraded() {
    let h = TestHarness::new();
    let key = create_env(&h);
    bring_up(&h, &key).await;
    let url = h.store.status(&key).expect("status").access_url;

    h.cluster
        .delete(ObjectKind::Deployment, NAMESPACE, "workspace")
        .await
        .expect("delete");
    reconcile(&h, &key).await;

    assert!(h.cluster.contains(ObjectKind::Deployment, NAMESPACE, "workspace"));
    let status = h.store.status(&key).expect("status");
    assert_eq!(status.phase, Phase::Degraded);
    assert_eq!(status.access_url, url);

    h.cluster.set_ready_replicas(NAMESPACE, "workspace", 1);
    reconcile(&h, &key).await;
    assert_eq!(h.store.phase(&key), Some(Phase::Running));
}

#[tokio::test]
async fn stale_namespaces_are_collected() {
    let h = TestHarness::new();
    let key = create_env(&h);
    let old = ProjectionSettings {
        namespace_prefix: "old".to_string(),
        ..ProjectionSettings::default()
    };
    let stale = builder::build(&key, &sample_spec("u1"), &old).expect("build");
    for object in stale.objects() {
        h.cluster.insert(object.clone());
    }
    assert!(h.cluster.contains(ObjectKind::Namespace, "old-u1-env1", "old-u1-env1"));

    reconcile(&h, &key).await;

    assert!(!h.cluster.contains(ObjectKind::Namespace, "old-u1-env1", "old-u1-env1"));
    assert!(!h.cluster.contains(ObjectKind::Deployment, "old-u1-env1", "workspace"));
    assert!(h.cluster.contains(ObjectKind::Namespace, NAMESPACE, NAMESPACE));
}

#[tokio::test]
async fn terminating_namespace_is_waited_on() {
    let h = TestHarness::new();
    let key = create_env(&h);
    reconcile(&h, &key).await;

    h.cluster
        .edit(ObjectKind::Namespace, NAMESPACE, NAMESPACE, |object| {
            if let ProjectedObject::Namespace(ns) = object {
                if let Some(status) = ns.status.as_mut() {
                    status.phase = Some("Terminating".to_string());
                }
            }
        });
    h.cluster.clear_calls();

    let err = h.reconciler.reconcile(&key).await.expect_err("terminating");
    assert!(!err.is_terminal());
    assert!(h.cluster.mutating_calls().is_empty());
}
