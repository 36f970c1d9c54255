//! Resource watcher: DevEnvironment events to reconciliation requests.
//!
//! [`EventNormalizer`] is the pure part: it turns raw watch events into
//! typed requests and drops status-only updates. [`ResourceWatcher`] feeds
//! it from the API server, and [`Resyncer`] re-enqueues everything on a
//! fixed period.

use crate::client::{ClusterClient, ObjectKind};
use crate::crd::{DevEnvironment, EnvironmentKey};
use crate::error::ClientError;
use crate::naming;
use crate::queue::{ReconcileReason, Request, WorkQueue};
use crate::store::EnvironmentStore;
use futures::StreamExt;
use kube::Api;
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Config, watcher};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Seen {
    generation: Option<i64>,
    deleting: bool,
}

/// Turns watch events into reconciliation requests.
///
/// Remembers the last seen generation of every object so that updates which
/// only touch status or metadata do not cause work.
#[derive(Debug, Default)]
pub struct EventNormalizer {
    seen: HashMap<EnvironmentKey, Seen>,
    relisted: Option<HashSet<EnvironmentKey>>,
}

impl EventNormalizer {
    /// Create an empty normalizer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests caused by one watch event.
    pub fn normalize(
        &mut self,
        event: watcher::Event<DevEnvironment>,
    ) -> Vec<Request<EnvironmentKey>> {
        match event {
            watcher::Event::Apply(env) => self.observe(&env, false).into_iter().collect(),
            watcher::Event::Delete(env) => {
                let key = env.key();
                self.seen.remove(&key);
                vec![Request {
                    key,
                    reason: ReconcileReason::Deleted,
                }]
            }
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(env) => {
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(env.key());
                }
                self.observe(&env, true).into_iter().collect()
            }
            watcher::Event::InitDone => {
                let Some(relisted) = self.relisted.take() else {
                    return Vec::new();
                };
                let vanished: Vec<EnvironmentKey> = self
                    .seen
                    .keys()
                    .filter(|key| !relisted.contains(*key))
                    .cloned()
                    .collect();
                vanished
                    .into_iter()
                    .map(|key| {
                        self.seen.remove(&key);
                        Request {
                            key,
                            reason: ReconcileReason::Deleted,
                        }
                    })
                    .collect()
            }
        }
    }

    fn observe(&mut self, env: &DevEnvironment, relist: bool) -> Option<Request<EnvironmentKey>> {
        let key = env.key();
        let current = Seen {
            generation: env.metadata.generation,
            deleting: env.is_deleting(),
        };
        let previous = self.seen.insert(key.clone(), current);

        let reason = match previous {
            None if current.deleting => ReconcileReason::Deleted,
            None => ReconcileReason::Added,
            Some(prev) if current.deleting && !prev.deleting => ReconcileReason::Deleted,
            Some(prev) if prev.generation != current.generation => ReconcileReason::Modified,
            Some(_) if relist => ReconcileReason::Resynced,
            Some(_) => return None,
        };
        Some(Request { key, reason })
    }

    /// Number of objects currently known.
    pub fn known(&self) -> usize {
        self.seen.len()
    }
}

/// Streams DevEnvironment events into the work queue.
pub struct ResourceWatcher {
    api: Api<DevEnvironment>,
    queue: WorkQueue<EnvironmentKey>,
}

impl ResourceWatcher {
    /// Watch `api` and feed `queue`.
    pub fn new(api: Api<DevEnvironment>, queue: WorkQueue<EnvironmentKey>) -> Self {
        Self { api, queue }
    }

    /// Run until the queue shuts down or the stream ends.
    pub async fn run(self) {
        let mut normalizer = EventNormalizer::new();
        let mut stream = watcher(self.api, Config::default())
            .default_backoff()
            .boxed();

        info!("DevEnvironment watcher started");

        while let Some(event) = stream.next().await {
            if self.queue.is_shutdown() {
                break;
            }
            match event {
                Ok(event) => {
                    for request in normalizer.normalize(event) {
                        debug!(
                            environment = %request.key,
                            reason = %request.reason,
                            "Enqueuing reconciliation"
                        );
                        self.queue.enqueue(request.key, request.reason);
                    }
                }
                Err(e) => {
                    error!(error = %e, "DevEnvironment watch error");
                }
            }
        }

        warn!("DevEnvironment watcher stream ended");
    }
}

/// Periodic full re-enqueue.
///
/// Besides every stored environment, enqueues environments that no longer
/// exist but still own a workspace namespace, so a restarted operator
/// cleans up after deletions it missed.
pub struct Resyncer {
    store: Arc<dyn EnvironmentStore>,
    client: Arc<dyn ClusterClient>,
    queue: WorkQueue<EnvironmentKey>,
    interval: Duration,
    watch_namespace: Option<String>,
}

impl Resyncer {
    /// Create a resyncer.
    pub fn new(
        store: Arc<dyn EnvironmentStore>,
        client: Arc<dyn ClusterClient>,
        queue: WorkQueue<EnvironmentKey>,
        interval: Duration,
        watch_namespace: Option<String>,
    ) -> Self {
        Self {
            store,
            client,
            queue,
            interval,
            watch_namespace,
        }
    }

    /// Enqueue every known identity once. Returns how many were enqueued.
    pub async fn resync_once(&self) -> Result<usize, ClientError> {
        let environments = self.store.list().await?;
        let live: HashSet<EnvironmentKey> = environments.iter().map(|e| e.key()).collect();
        for key in &live {
            self.queue.enqueue(key.clone(), ReconcileReason::Resynced);
        }

        let mut orphans = 0;
        let namespaces = self
            .client
            .list(ObjectKind::Namespace, &naming::managed_selector())
            .await?;
        for namespace in namespaces {
            let Some(key) = namespace
                .annotation(naming::ENVIRONMENT_ANNOTATION)
                .and_then(parse_key)
            else {
                continue;
            };
            let in_scope = self
                .watch_namespace
                .as_ref()
                .map_or(true, |ns| *ns == key.namespace);
            if in_scope && !live.contains(&key) {
                self.queue.enqueue(key, ReconcileReason::Deleted);
                orphans += 1;
            }
        }

        Ok(live.len() + orphans)
    }

    /// Resync every `interval`, starting immediately.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if self.queue.is_shutdown() {
                break;
            }
            match self.resync_once().await {
                Ok(count) => debug!(count, "Resync enqueued environments"),
                Err(e) => warn!(error = %e, "Resync failed"),
            }
        }
    }
}

fn parse_key(value: &str) -> Option<EnvironmentKey> {
    let (namespace, name) = value.split_once('/')?;
    (!namespace.is_empty() && !name.is_empty()).then(|| EnvironmentKey::new(namespace, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DevEnvironmentSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn env(name: &str, generation: i64) -> DevEnvironment {
        let mut env = DevEnvironment::new(
            name,
            DevEnvironmentSpec {
                owner: "u1".to_string(),
                git_repository: None,
                git_ref: None,
                image: "base:latest".to_string(),
                init_commands: vec![],
                start_command: None,
                ports: vec![8080],
                resource_limits: None,
                storage_size: None,
                env: Default::default(),
                suspended: false,
                restart_nonce: None,
            },
        );
        env.metadata.namespace = Some("kubedev".to_string());
        env.metadata.generation = Some(generation);
        env
    }

    fn reasons(requests: Vec<Request<EnvironmentKey>>) -> Vec<ReconcileReason> {
        requests.into_iter().map(|r| r.reason).collect()
    }

    #[test]
    fn creation_and_generation_bumps_enqueue() {
        let mut n = EventNormalizer::new();
        assert_eq!(
            reasons(n.normalize(watcher::Event::Apply(env("a", 1)))),
            vec![ReconcileReason::Added]
        );
        assert_eq!(
            reasons(n.normalize(watcher::Event::Apply(env("a", 2)))),
            vec![ReconcileReason::Modified]
        );
    }

    #[test]
    fn status_only_updates_are_dropped() {
        let mut n = EventNormalizer::new();
        n.normalize(watcher::Event::Apply(env("a", 1)));
        let mut with_status = env("a", 1);
        with_status.status = Some(Default::default());
        assert!(n.normalize(watcher::Event::Apply(with_status)).is_empty());
    }

    #[test]
    fn deletion_timestamp_counts_as_deleted_once() {
        let mut n = EventNormalizer::new();
        n.normalize(watcher::Event::Apply(env("a", 1)));

        let mut deleting = env("a", 2);
        deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert_eq!(
            reasons(n.normalize(watcher::Event::Apply(deleting.clone()))),
            vec![ReconcileReason::Deleted]
        );
        assert!(n.normalize(watcher::Event::Apply(deleting)).is_empty());
    }

    #[test]
    fn relist_resyncs_known_and_deletes_vanished() {
        let mut n = EventNormalizer::new();
        n.normalize(watcher::Event::Apply(env("a", 1)));
        n.normalize(watcher::Event::Apply(env("b", 1)));

        assert!(n.normalize(watcher::Event::Init).is_empty());
        assert_eq!(
            reasons(n.normalize(watcher::Event::InitApply(env("a", 1)))),
            vec![ReconcileReason::Resynced]
        );
        assert_eq!(
            reasons(n.normalize(watcher::Event::InitApply(env("c", 1)))),
            vec![ReconcileReason::Added]
        );
        let done = n.normalize(watcher::Event::InitDone);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].key, EnvironmentKey::new("kubedev", "b"));
        assert_eq!(done[0].reason, ReconcileReason::Deleted);
        assert_eq!(n.known(), 2);
    }

    #[test]
    fn environment_annotation_parses_into_a_key() {
        assert_eq!(
            parse_key("kubedev/env1"),
            Some(EnvironmentKey::new("kubedev", "env1"))
        );
        assert_eq!(parse_key("nonsense"), None);
        assert_eq!(parse_key("/env1"), None);
    }
}
