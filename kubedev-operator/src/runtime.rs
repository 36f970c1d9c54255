//! Worker pool driving the reconciler from the work queue.

use crate::controller::{ReconcileOutcome, Reconciler};
use crate::crd::EnvironmentKey;
use crate::queue::{ReconcileReason, Request, WorkQueue};
use std::future::Future;
use std::sync::Arc;
use tracing::Instrument;

/// Runs N workers over a shared [`WorkQueue`].
///
/// A key is handed to one worker at a time; distinct keys proceed in
/// parallel, bounded by the number of workers.
#[derive(Clone)]
pub struct WorkerPool {
    reconciler: Reconciler,
    queue: WorkQueue<EnvironmentKey>,
}

impl WorkerPool {
    /// Create a pool over `queue`.
    pub fn new(reconciler: Reconciler, queue: WorkQueue<EnvironmentKey>) -> Self {
        Self { reconciler, queue }
    }

    /// The queue this pool drains.
    pub fn queue(&self) -> &WorkQueue<EnvironmentKey> {
        &self.queue
    }

    /// Spawn the configured number of workers and wait until `shutdown`
    /// completes, then stop the queue and let in-flight work finish.
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        let workers = self.reconciler.context().config.workers;
        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let pool = self.clone();
                tokio::spawn(async move { pool.worker(id).await })
            })
            .collect();

        tracing::info!(workers, "Reconciliation workers started");
        shutdown.await;
        tracing::info!("Shutting down reconciliation workers");
        self.queue.shutdown();

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
    }

    async fn worker(&self, id: usize) {
        while let Some(request) = self.queue.next().await {
            let span = tracing::info_span!(
                "reconcile",
                worker = id,
                environment = %request.key,
                reason = %request.reason,
            );
            self.process(request).instrument(span).await;
        }
        tracing::debug!(worker = id, "Worker stopped");
    }

    /// Handle one request taken from the queue, then release its key.
    pub async fn process(&self, request: Request<EnvironmentKey>) {
        let Request { key, reason } = request;
        let deadline = self.reconciler.context().config.reconcile_deadline;

        let result = tokio::time::timeout(deadline, self.reconciler.reconcile(&key)).await;
        if result.is_err() {
            tracing::warn!(
                deadline_secs = deadline.as_secs(),
                "Reconciliation exceeded its deadline"
            );
            if let Err(e) = self.reconciler.record_deadline(&key).await {
                tracing::warn!(error = %e, "Failed to record deadline");
            }
        }
        self.queue.done(&key);

        match result {
            Ok(Ok(outcome)) => {
                self.queue.forget(&key);
                match outcome {
                    ReconcileOutcome::Requeue(after) => {
                        self.queue
                            .enqueue_after(key, ReconcileReason::Resynced, after);
                    }
                    ReconcileOutcome::Await => {
                        tracing::debug!("Waiting for a spec change");
                    }
                    ReconcileOutcome::Terminated => {
                        tracing::debug!("Environment terminated");
                    }
                }
            }
            Ok(Err(err)) => {
                let delay = self.queue.requeue_with_backoff(key, reason);
                tracing::warn!(
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "Reconciliation failed"
                );
            }
            Err(_) => {
                self.queue.requeue_with_backoff(key, reason);
            }
        }
    }
}
