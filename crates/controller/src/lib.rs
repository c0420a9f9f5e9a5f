//! ekspose controller: wires the cache mirror, the change listener, the dispatch
//! queue and the worker pool into one level-triggered control loop.
//!
//! ```text
//! watcher ──StreamEvent──▶ ingest (cache mirror) ──WatchEvent──▶ ChangeListener ──key──▶ DispatchQueue
//!                                   ▲                                                      │
//!                                   └──────────── lookup ◀── Reconciler ◀── Worker ◀───────┘
//! ```

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;

use ekspose_core::{ConfigError, ControllerConfig, EventHandler, StreamEvent};
use ekspose_kubehub::ClusterApi;
use ekspose_queue::DispatchQueue;
use ekspose_store::{spawn_ingest, CacheMirror};
use tokio::sync::mpsc;
use tracing::{info, warn};

mod listener;
mod reconciler;
mod worker;

pub use listener::ChangeListener;
pub use reconciler::{dependent_name, desired_dependent, Outcome, Reconcile, Reconciler};
pub use worker::{spawn_workers, PermanentFailure, Worker};

/// Name used for the dispatch queue in logs and metrics.
pub const QUEUE_NAME: &str = "ekspose";

pub struct Controller<R: ?Sized> {
    cfg: Arc<ControllerConfig>,
    queue: Arc<DispatchQueue>,
    mirror: CacheMirror,
    cluster: Arc<dyn ClusterApi>,
    reconciler: Arc<R>,
    failures: Option<mpsc::UnboundedSender<PermanentFailure>>,
}

impl<R: Reconcile + ?Sized + 'static> Controller<R> {
    pub fn new(
        cfg: Arc<ControllerConfig>,
        queue: Arc<DispatchQueue>,
        mirror: CacheMirror,
        cluster: Arc<dyn ClusterApi>,
        reconciler: Arc<R>,
    ) -> Self {
        Self { cfg, queue, mirror, cluster, reconciler, failures: None }
    }

    /// Receive a report for every key dropped without converging.
    pub fn with_failure_reports(mut self, tx: mpsc::UnboundedSender<PermanentFailure>) -> Self {
        self.failures = Some(tx);
        self
    }

    pub fn queue(&self) -> &Arc<DispatchQueue> { &self.queue }
    pub fn mirror(&self) -> &CacheMirror { &self.mirror }

    /// Run until `shutdown` resolves. Workers only start once the mirror is warm;
    /// on shutdown the queue stops delivering and in-flight reconciles finish.
    pub async fn run<S: Future<Output = ()>>(self, shutdown: S) {
        tokio::pin!(shutdown);
        info!(workers = self.cfg.workers, "starting controller");

        tokio::select! {
            warm = self.mirror.wait_ready() => {
                if !warm {
                    warn!("ingest stopped before the cache mirror warmed; exiting");
                    self.queue.shutdown();
                    return;
                }
            }
            _ = &mut shutdown => {
                info!("shutdown requested before cache sync");
                self.queue.shutdown();
                return;
            }
        }
        info!(objects = self.mirror.current().len(), "cache synced; starting workers");

        let workers = spawn_workers(self.cfg.workers, &self.queue, &self.reconciler, self.failures.clone());
        let resync = {
            let queue = Arc::clone(&self.queue);
            let mirror = self.mirror.clone();
            let cluster = Arc::clone(&self.cluster);
            let namespace = self.cfg.namespace.clone();
            let period = self.cfg.resync_period;
            tokio::spawn(async move {
                sweep_orphans(cluster.as_ref(), namespace.as_deref(), &mirror, &queue).await;
                let Some(period) = period else { return };
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    let keys = mirror.current().keys();
                    info!(count = keys.len(), "periodic resync");
                    for key in keys {
                        queue.enqueue(key);
                    }
                    sweep_orphans(cluster.as_ref(), namespace.as_deref(), &mirror, &queue).await;
                }
            })
        };

        shutdown.await;
        info!("shutting down controller");
        self.queue.shutdown();
        resync.abort();
        for h in workers {
            if let Err(e) = h.await {
                warn!(error = %e, "worker task ended abnormally");
            }
        }
        info!("controller stopped");
    }
}

/// Enqueue the owner of every managed Service whose Deployment is not cached, so
/// Services left behind while no controller was running get deleted.
async fn sweep_orphans(cluster: &dyn ClusterApi, namespace: Option<&str>, mirror: &CacheMirror, queue: &DispatchQueue) {
    let managed = match cluster.list_dependents(namespace).await {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "listing managed services failed; orphan sweep skipped");
            return;
        }
    };
    let snap = mirror.current();
    let mut orphans = 0usize;
    for owner in managed.into_iter().filter_map(|d| d.owner_key) {
        if snap.get(&owner).is_none() {
            orphans += 1;
            queue.enqueue(owner);
        }
    }
    if orphans > 0 {
        info!(orphans, "enqueued services without a cached deployment");
    }
}

/// Assemble a controller around `cluster`: dispatch queue, change listener,
/// cache mirror ingest loop and reconciler. Returns the sender the watcher feeds.
/// Must be called within a tokio runtime.
pub fn build<C: ClusterApi + 'static>(
    cfg: ControllerConfig,
    cluster: Arc<C>,
) -> Result<(mpsc::Sender<StreamEvent>, Controller<Reconciler<C>>), ConfigError> {
    cfg.validate()?;
    let cfg = Arc::new(cfg);
    let queue = Arc::new(DispatchQueue::from_config(QUEUE_NAME, &cfg));
    let listener: Arc<dyn EventHandler> = Arc::new(ChangeListener::new(Arc::clone(&queue)));
    let (tx, mirror) = spawn_ingest(cfg.queue_cap, vec![listener]);
    let reconciler = Arc::new(Reconciler::new(Arc::clone(&cluster), mirror.clone(), Arc::clone(&cfg)));
    Ok((tx, Controller::new(cfg, queue, mirror, cluster, reconciler)))
}
