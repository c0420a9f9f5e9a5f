use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use ekspose_core::{LogicalKey, ReconcileError};
use ekspose_queue::{DispatchQueue, RetryDecision};
use futures::FutureExt;
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::reconciler::Reconcile;

/// A key dropped from the queue without converging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermanentFailure {
    pub key: LogicalKey,
    pub reason: String,
    /// Attempts made before giving up; 1 for errors that are never retried.
    pub attempts: u32,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// One member of the worker pool. Loops until the queue shuts down.
pub struct Worker<R: ?Sized> {
    pub id: usize,
    queue: Arc<DispatchQueue>,
    reconciler: Arc<R>,
    failures: Option<mpsc::UnboundedSender<PermanentFailure>>,
}

impl<R: Reconcile + ?Sized> Worker<R> {
    pub fn new(
        id: usize,
        queue: Arc<DispatchQueue>,
        reconciler: Arc<R>,
        failures: Option<mpsc::UnboundedSender<PermanentFailure>>,
    ) -> Self {
        Self { id, queue, reconciler, failures }
    }

    pub async fn run(self) {
        debug!(worker = self.id, "worker started");
        while self.process_next().await {}
        debug!(worker = self.id, "worker stopped");
    }

    fn report(&self, failure: PermanentFailure) {
        error!(key = %failure.key, attempts = failure.attempts, reason = %failure.reason, "giving up on key");
        counter!("reconcile_permanent_failures", 1u64);
        if let Some(tx) = &self.failures {
            let _ = tx.send(failure);
        }
    }

    /// Handle one key. Returns false once the queue is shutting down.
    pub async fn process_next(&self) -> bool {
        let Some(lease) = self.queue.lease().await else {
            return false;
        };
        let key = lease.key().clone();
        let t0 = Instant::now();
        // A panicking reconcile still releases the lease and is retried like a transient error.
        let result = AssertUnwindSafe(self.reconciler.reconcile(&key))
            .catch_unwind()
            .await
            .unwrap_or_else(|p| Err(ReconcileError::Transient(format!("reconcile panicked: {}", panic_message(p.as_ref())))));
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);

        match result {
            Ok(outcome) => {
                counter!("reconcile_total", 1u64, "outcome" => outcome.as_str());
                self.queue.forget(&key);
                lease.finish();
                debug!(worker = self.id, key = %key, outcome = outcome.as_str(), "reconciled");
            }
            Err(e) if e.is_retryable() => {
                counter!("reconcile_errors", 1u64, "class" => "transient");
                let key = lease.finish();
                match self.queue.requeue_rate_limited(key.clone()) {
                    RetryDecision::Retry(delay) => {
                        warn!(worker = self.id, key = %key, error = %e, retry_in_ms = delay.as_millis() as u64, "reconcile failed; requeued");
                    }
                    RetryDecision::GiveUp(attempts) => {
                        self.report(PermanentFailure { key, reason: e.to_string(), attempts });
                    }
                }
            }
            Err(e) => {
                counter!("reconcile_errors", 1u64, "class" => "permanent");
                self.queue.forget(&key);
                lease.finish();
                self.report(PermanentFailure { key, reason: e.to_string(), attempts: 1 });
            }
        }
        true
    }
}

/// Spawn `n` workers on the current runtime.
pub fn spawn_workers<R: Reconcile + ?Sized + 'static>(
    n: usize,
    queue: &Arc<DispatchQueue>,
    reconciler: &Arc<R>,
    failures: Option<mpsc::UnboundedSender<PermanentFailure>>,
) -> Vec<tokio::task::JoinHandle<()>> {
    info!(workers = n, queue = %queue.name(), "spawning workers");
    (0..n)
        .map(|id| {
            let w = Worker::new(id, Arc::clone(queue), Arc::clone(reconciler), failures.clone());
            tokio::spawn(w.run())
        })
        .collect()
}
