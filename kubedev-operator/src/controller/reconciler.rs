//! DevEnvironment reconciler.
//!
//! Converges one environment per call. Every call re-reads the spec and the
//! live projection, so it is safe to repeat and safe to interrupt.

use super::observed::{
    ObservedProjection, cluster_ip, deployment_ready, namespace_terminating, needs_update,
};
use super::{ControllerContext, ReconcileOutcome};
use crate::builder::{self, ProjectionSet};
use crate::client::ObjectKind;
use crate::crd::{DevEnvironment, EnvironmentKey, Phase};
use crate::error::{ClientError, OperatorResult};
use crate::naming;
use crate::status::{Endpoint, Observation};
use std::sync::Arc;

/// Reconciler for DevEnvironment resources.
#[derive(Clone)]
pub struct Reconciler {
    ctx: Arc<ControllerContext>,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(ctx: Arc<ControllerContext>) -> Self {
        Self { ctx }
    }

    /// Shared context.
    pub fn context(&self) -> &Arc<ControllerContext> {
        &self.ctx
    }

    /// Reconcile the environment at `key`.
    ///
    /// 1. Missing object: tear down whatever is still labeled for it
    /// 2. Deletion requested: tear down, then release the finalizer
    /// 3. Otherwise: build the desired projection, apply the diff in
    ///    dependency order and report readiness
    ///
    /// Terminal errors are reported as `Failed` and return `Ok(Await)`.
    /// Retryable errors are reported and returned, so the caller can back off.
    pub async fn reconcile(&self, key: &EnvironmentKey) -> OperatorResult<ReconcileOutcome> {
        let Some(env) = self.ctx.store.get(key).await? else {
            return self.teardown_orphan(key).await;
        };

        tracing::info!(
            environment = %key,
            phase = %env.phase(),
            generation = ?env.metadata.generation,
            "Reconciling DevEnvironment"
        );

        if env.is_deleting() {
            return self.handle_deletion(&env).await;
        }

        if !env.has_finalizer() {
            self.ctx.store.add_finalizer(key).await?;
        }

        match self.converge(&env).await {
            Ok(observation) => {
                self.ctx.reporter.report(&env, &observation).await?;
                Ok(ReconcileOutcome::for_phase(
                    observation.phase,
                    &self.ctx.config,
                ))
            }
            Err(err) if err.is_terminal() => {
                tracing::error!(environment = %key, error = %err, "DevEnvironment failed");
                let observation = Observation::new(Phase::Failed, err.to_string());
                self.ctx.reporter.report(&env, &observation).await?;
                Ok(ReconcileOutcome::Await)
            }
            Err(err) => {
                tracing::warn!(environment = %key, error = %err, "Reconciliation failed, will retry");
                let observation =
                    Observation::new(Self::retry_phase(&env), format!("Retrying: {err}"));
                if let Err(report_err) = self.ctx.reporter.report(&env, &observation).await {
                    tracing::warn!(environment = %key, error = %report_err, "Failed to report status");
                }
                Err(err)
            }
        }
    }

    /// Record that an attempt for `key` ran past its deadline.
    pub async fn record_deadline(&self, key: &EnvironmentKey) -> OperatorResult<()> {
        let Some(env) = self.ctx.store.get(key).await? else {
            return Ok(());
        };
        if env.is_deleting() {
            return Ok(());
        }
        let observation = Observation::new(
            Self::retry_phase(&env),
            format!(
                "Reconciliation exceeded its {}s deadline, retrying",
                self.ctx.config.reconcile_deadline.as_secs()
            ),
        );
        self.ctx.reporter.report(&env, &observation).await?;
        Ok(())
    }

    fn retry_phase(env: &DevEnvironment) -> Phase {
        if env.phase().was_serving() {
            Phase::Degraded
        } else {
            Phase::Provisioning
        }
    }

    async fn converge(&self, env: &DevEnvironment) -> OperatorResult<Observation> {
        let key = env.key();
        let projection = builder::build(&key, &env.spec, &self.ctx.config.projection)?;
        let namespace = projection.namespace.clone();
        let mut observed = ObservedProjection::new(self.ctx.client.as_ref(), &namespace);

        if let Some(ns) = observed.get(ObjectKind::Namespace, &namespace).await? {
            if namespace_terminating(ns) {
                return Err(ClientError::Unavailable(format!(
                    "namespace {namespace} is still terminating"
                ))
                .into());
            }
        }

        let mut restarted = None;
        if !env.spec.suspended {
            if let Some(nonce) = env.pending_restart() {
                tracing::info!(environment = %key, namespace = %namespace, "Restarting workspace");
                if !self.remove_deployment(&projection, &mut observed).await? {
                    return Ok(Observation::new(
                        Phase::Provisioning,
                        "Waiting for the workspace to stop before restarting",
                    )
                    .with_namespace(namespace));
                }
                restarted = Some(nonce.to_string());
            }
        }

        let written = self.apply(&projection, &mut observed).await?;
        self.collect_stale_namespaces(&key, &namespace).await?;

        if !written.is_empty() {
            tracing::debug!(environment = %key, kinds = ?written, "Converged drifted or missing objects");
        }

        // Repairing drift is not a rollout; only a new spec or a restart is.
        let spec_changed = env
            .status
            .as_ref()
            .and_then(|status| status.observed_generation)
            != env.metadata.generation;
        let rolled = restarted.is_some() || spec_changed;
        let observation = self
            .observe_readiness(env, &projection, &mut observed, rolled)
            .await?;
        Ok(observation
            .with_namespace(namespace)
            .with_restart_observed(restarted))
    }

    /// Bring each kind to its desired state, in dependency order.
    ///
    /// Stops at the first failure; later kinds stay untouched until the next
    /// attempt re-diffs. Returns the kinds that were written.
    async fn apply(
        &self,
        projection: &ProjectionSet,
        observed: &mut ObservedProjection<'_>,
    ) -> Result<Vec<ObjectKind>, ClientError> {
        let client = &self.ctx.client;
        let namespace = projection.namespace.as_str();
        let mut written = Vec::new();

        for kind in ObjectKind::APPLY_ORDER {
            let name = projection.object_name(kind);
            let live = observed.get(kind, name).await?.cloned();

            match (projection.get(kind), live) {
                (Some(desired), None) => {
                    tracing::info!(namespace = %namespace, kind = %kind, name = %name, "Creating object");
                    client.create(desired).await?;
                }
                (Some(desired), Some(live)) if needs_update(desired, &live) => {
                    tracing::info!(namespace = %namespace, kind = %kind, name = %name, "Updating drifted object");
                    client.update(desired).await?;
                }
                (Some(_), Some(_)) => {
                    tracing::debug!(namespace = %namespace, kind = %kind, name = %name, "Object up to date");
                    continue;
                }
                (None, Some(_)) => {
                    tracing::info!(namespace = %namespace, kind = %kind, name = %name, "Removing object");
                    client.delete(kind, namespace, name).await?;
                }
                (None, None) => continue,
            }
            observed.invalidate(kind);
            written.push(kind);
        }

        Ok(written)
    }

    /// Delete the deployment and confirm it is gone.
    async fn remove_deployment(
        &self,
        projection: &ProjectionSet,
        observed: &mut ObservedProjection<'_>,
    ) -> Result<bool, ClientError> {
        let name = projection.object_name(ObjectKind::Deployment);
        if observed.get(ObjectKind::Deployment, name).await?.is_none() {
            return Ok(true);
        }
        self.ctx
            .client
            .delete(ObjectKind::Deployment, &projection.namespace, name)
            .await?;
        observed.invalidate(ObjectKind::Deployment);
        Ok(observed.get(ObjectKind::Deployment, name).await?.is_none())
    }

    /// Delete namespaces still labeled for `key` other than `current`.
    async fn collect_stale_namespaces(
        &self,
        key: &EnvironmentKey,
        current: &str,
    ) -> Result<(), ClientError> {
        let selector = naming::instance_selector(key);
        let namespaces = self.ctx.client.list(ObjectKind::Namespace, &selector).await?;
        for ns in namespaces {
            if ns.name() == current || namespace_terminating(&ns) {
                continue;
            }
            tracing::info!(environment = %key, namespace = %ns.name(), "Deleting stale workspace namespace");
            self.ctx
                .client
                .delete(ObjectKind::Namespace, ns.name(), ns.name())
                .await?;
        }
        Ok(())
    }

    async fn observe_readiness(
        &self,
        env: &DevEnvironment,
        projection: &ProjectionSet,
        observed: &mut ObservedProjection<'_>,
        rolled: bool,
    ) -> Result<Observation, ClientError> {
        if env.spec.suspended {
            return Ok(Observation::new(
                Phase::Stopped,
                "Workspace stopped, storage retained",
            ));
        }

        let deployment = projection.object_name(ObjectKind::Deployment);
        let ready = observed
            .get(ObjectKind::Deployment, deployment)
            .await?
            .is_some_and(deployment_ready);

        if ready {
            let internal_ip = match projection.get(ObjectKind::Service) {
                Some(_) => observed
                    .get(ObjectKind::Service, projection.object_name(ObjectKind::Service))
                    .await?
                    .and_then(cluster_ip),
                None => None,
            };
            let endpoint = Endpoint {
                access_url: projection.access_url(),
                internal_ip,
                external_port: projection.primary_port,
            };
            return Ok(Observation::new(Phase::Running, "Workspace is ready").with_endpoint(endpoint));
        }

        if !rolled && env.phase().was_serving() {
            return Ok(Observation::new(
                Phase::Degraded,
                "Workspace lost readiness",
            ));
        }
        Ok(Observation::new(
            Phase::Provisioning,
            "Waiting for the workspace to become ready",
        ))
    }

    async fn handle_deletion(&self, env: &DevEnvironment) -> OperatorResult<ReconcileOutcome> {
        let key = env.key();
        if !env.has_finalizer() {
            return Ok(ReconcileOutcome::Terminated);
        }

        self.ctx
            .reporter
            .report(env, &Observation::new(Phase::Terminating, "Tearing down workspace"))
            .await?;

        let remaining = self.teardown(&key).await?;
        if remaining > 0 {
            tracing::info!(environment = %key, remaining, "Waiting for workspace namespaces to go away");
            return Ok(ReconcileOutcome::Requeue(self.ctx.config.requeue_short));
        }

        self.ctx.store.remove_finalizer(&key).await?;
        tracing::info!(environment = %key, "DevEnvironment torn down");
        Ok(ReconcileOutcome::Terminated)
    }

    async fn teardown_orphan(&self, key: &EnvironmentKey) -> OperatorResult<ReconcileOutcome> {
        let remaining = self.teardown(key).await?;
        if remaining > 0 {
            return Ok(ReconcileOutcome::Requeue(self.ctx.config.requeue_short));
        }
        tracing::debug!(environment = %key, "No DevEnvironment and nothing left to remove");
        Ok(ReconcileOutcome::Terminated)
    }

    /// Delete everything labeled for `key`, in reverse apply order.
    ///
    /// Returns how many namespaces still exist; zero means teardown is
    /// confirmed.
    async fn teardown(&self, key: &EnvironmentKey) -> Result<usize, ClientError> {
        let client = &self.ctx.client;
        let selector = naming::instance_selector(key);

        for kind in ObjectKind::APPLY_ORDER.iter().rev().copied() {
            for object in client.list(kind, &selector).await? {
                if kind == ObjectKind::Namespace && namespace_terminating(&object) {
                    continue;
                }
                tracing::info!(
                    environment = %key,
                    namespace = %object.namespace(),
                    kind = %kind,
                    name = %object.name(),
                    "Deleting object"
                );
                client.delete(kind, object.namespace(), object.name()).await?;
            }
        }

        Ok(client.list(ObjectKind::Namespace, &selector).await?.len())
    }
}
