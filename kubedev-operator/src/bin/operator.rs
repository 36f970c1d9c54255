//! kubedev operator binary.
//!
//! Watches DevEnvironment resources and reconciles each one into its
//! workspace namespace. Configuration comes from `KUBEDEV_*` environment
//! variables; command-line flags take precedence.

use anyhow::Context;
use clap::Parser;
use kube::{Client, CustomResourceExt};
use kubedev_operator::client::{KubeClusterClient, RetryingClient};
use kubedev_operator::controller::{ControllerContext, Reconciler};
use kubedev_operator::crd::DevEnvironment;
use kubedev_operator::observability::{TracingConfig, init_tracing};
use kubedev_operator::queue::WorkQueue;
use kubedev_operator::retry::SystemClock;
use kubedev_operator::runtime::WorkerPool;
use kubedev_operator::store::{EnvironmentStore, KubeEnvironmentStore, RetryingStore};
use kubedev_operator::watcher::{ResourceWatcher, Resyncer};
use kubedev_operator::OperatorConfig;
use std::sync::Arc;
use std::time::Duration;

/// kubedev workspace operator.
#[derive(Parser)]
#[command(name = "kubedev-operator")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Print the CustomResourceDefinition YAML and exit
    #[arg(long)]
    generate_crds: bool,

    /// Number of reconciliation workers
    #[arg(long)]
    workers: Option<usize>,

    /// Namespace holding DevEnvironment objects (default: all namespaces)
    #[arg(long)]
    watch_namespace: Option<String>,

    /// Full resync period in seconds
    #[arg(long)]
    resync_secs: Option<u64>,

    /// Base domain for workspace ingress hosts
    #[arg(long)]
    base_domain: Option<String>,
}

impl Cli {
    fn apply(&self, config: &mut OperatorConfig) {
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(ns) = &self.watch_namespace {
            config.watch_namespace = Some(ns.clone());
        }
        if let Some(secs) = self.resync_secs {
            config.resync_interval = Duration::from_secs(secs);
        }
        if let Some(domain) = &self.base_domain {
            config.projection.base_domain = domain.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.generate_crds {
        println!("---");
        println!("{}", serde_yaml::to_string(&DevEnvironment::crd())?);
        return Ok(());
    }

    init_tracing(&TracingConfig::from_env())?;

    let mut config = OperatorConfig::from_env().context("invalid configuration")?;
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;

    tracing::info!(
        workers = config.workers,
        watch_namespace = ?config.watch_namespace,
        "Starting kubedev operator"
    );

    let client = Client::try_default()
        .await
        .context("failed to connect to Kubernetes")?;
    tracing::info!("Connected to Kubernetes cluster");

    let clock = Arc::new(SystemClock);
    let cluster = Arc::new(RetryingClient::new(
        KubeClusterClient::new(client.clone(), config.request_timeout),
        config.client_retry.clone(),
        clock.clone(),
    ));
    let kube_store = KubeEnvironmentStore::new(client, config.watch_namespace.clone());
    let watched = kube_store.scoped_api();
    let store: Arc<dyn EnvironmentStore> = Arc::new(RetryingStore::new(
        Arc::new(kube_store),
        config.client_retry.clone(),
        clock.clone(),
    ));
    let queue = WorkQueue::new(config.requeue_backoff.clone());

    let watcher = ResourceWatcher::new(watched, queue.clone());
    let resyncer = Resyncer::new(
        store.clone(),
        cluster.clone(),
        queue.clone(),
        config.resync_interval,
        config.watch_namespace.clone(),
    );
    let ctx = Arc::new(ControllerContext::new(cluster, store, clock, config));
    let pool = WorkerPool::new(Reconciler::new(ctx), queue);

    let watch_task = tokio::spawn(watcher.run());
    let resync_task = tokio::spawn(resyncer.run());

    pool.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
    })
    .await;

    watch_task.abort();
    resync_task.abort();
    tracing::info!("kubedev operator stopped");
    Ok(())
}
