//! Controller lifecycle: watcher, workers, and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use convoy_core::{ObjectKey, ObjectStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::backoff::{BackoffConfig, BackoffTracker};
use crate::engine::{EngineConfig, ReconcileEngine};
use crate::error::{Error, Result};
use crate::hook::{ReconcileHook, ReconcileObserver};
use crate::outcome::ReconcileOutcome;
use crate::propagate::ChannelRegistry;
use crate::queue::WorkQueue;
use crate::watcher::EventWatcher;

/// Controller tuning knobs.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers.
    pub workers: usize,
    /// First retry delay after a transient failure.
    pub base_backoff: Duration,
    /// Ceiling on retry delays.
    pub max_backoff: Duration,
    /// Wall-clock budget for one reconcile attempt.
    pub reconcile_timeout: Duration,
    /// Budget for a single channel propagation call.
    pub propagation_timeout: Duration,
    /// Concurrent channel attempts per reconcile.
    pub channel_concurrency: usize,
    /// Buffered capacity of the observability hook.
    pub hook_capacity: usize,
    /// How long shutdown waits for in-flight work to drain.
    pub shutdown_grace: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(30),
            reconcile_timeout: Duration::from_secs(30),
            propagation_timeout: Duration::from_secs(10),
            channel_concurrency: 4,
            hook_capacity: 256,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl ControllerConfig {
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub const fn with_base_backoff(mut self, base: Duration) -> Self {
        self.base_backoff = base;
        self
    }

    pub const fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    pub const fn with_reconcile_timeout(mut self, budget: Duration) -> Self {
        self.reconcile_timeout = budget;
        self
    }

    pub const fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Handle used to request a controller stop.
#[derive(Debug, Clone)]
pub struct ControllerStopper {
    stop_tx: watch::Sender<bool>,
}

impl ControllerStopper {
    /// Signal the controller to stop taking work and drain.
    pub fn stop(&self) {
        self.stop_tx.send(true).ok();
    }
}

/// Level-triggered controller that converges Deployables onto their
/// channels.
///
/// `run` owns the whole lifecycle: it spawns the event watcher and the
/// worker pool, then blocks until stopped and drains in-flight work.
pub struct Controller {
    queue: Arc<WorkQueue>,
    engine: Arc<ReconcileEngine>,
    watcher: EventWatcher,
    config: ControllerConfig,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl Controller {
    /// Build a controller over `store` converging onto `channels`.
    ///
    /// Returns the controller and an observer that receives one entry
    /// per completed reconcile attempt.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        channels: ChannelRegistry,
        config: ControllerConfig,
    ) -> (Self, ReconcileObserver) {
        let (hook, observer) = ReconcileHook::channel(config.hook_capacity);
        let backoff = Arc::new(BackoffTracker::new(
            BackoffConfig::default()
                .with_base(config.base_backoff)
                .with_max(config.max_backoff),
        ));
        let engine = Arc::new(ReconcileEngine::new(
            store.clone(),
            Arc::new(channels),
            backoff,
            hook,
            EngineConfig {
                propagation_timeout: config.propagation_timeout,
                channel_concurrency: config.channel_concurrency,
            },
        ));
        let (stop_tx, stop_rx) = watch::channel(false);
        let queue = Arc::new(WorkQueue::new());
        // Subscribing here rather than in `run` means objects created as
        // soon as the controller exists are observed.
        let watcher = EventWatcher::new(store, queue.clone(), stop_rx.clone());
        let controller = Self {
            queue,
            engine,
            watcher,
            config,
            stop_tx,
            stop_rx,
        };
        (controller, observer)
    }

    /// Handle that stops the controller from another task.
    pub fn stopper(&self) -> ControllerStopper {
        ControllerStopper {
            stop_tx: self.stop_tx.clone(),
        }
    }

    /// Run until stopped, then drain within the shutdown grace period.
    pub async fn run(self) -> Result<()> {
        if self.config.workers == 0 {
            return Err(Error::invalid_config("workers must be at least 1"));
        }

        info!(workers = self.config.workers, "controller starting");

        let watcher_handle = self.watcher.spawn();

        let mut worker_handles: Vec<JoinHandle<()>> = Vec::with_capacity(self.config.workers);
        for worker in 0..self.config.workers {
            worker_handles.push(tokio::spawn(worker_loop(
                worker,
                self.queue.clone(),
                self.engine.clone(),
                self.config.reconcile_timeout,
            )));
        }

        let mut stop_rx = self.stop_rx.clone();
        while !*stop_rx.borrow() {
            if stop_rx.changed().await.is_err() {
                break;
            }
        }

        info!("controller stopping, draining in-flight work");
        self.queue.shut_down().await;

        let drain = async {
            watcher_handle.await.ok();
            for handle in worker_handles {
                handle.await.ok();
            }
        };
        if timeout(self.config.shutdown_grace, drain).await.is_err() {
            warn!(
                grace_secs = self.config.shutdown_grace.as_secs(),
                "shutdown grace period elapsed with work still in flight"
            );
            return Err(Error::ShutdownTimeout {
                grace_secs: self.config.shutdown_grace.as_secs(),
            });
        }

        info!("controller stopped");
        Ok(())
    }
}

/// One worker: pull a key, reconcile it under the attempt budget, act on
/// the outcome, mark the key done.
async fn worker_loop(
    worker: usize,
    queue: Arc<WorkQueue>,
    engine: Arc<ReconcileEngine>,
    reconcile_timeout: Duration,
) {
    debug!(worker, "worker started");
    while let Some(key) = queue.get().await {
        let outcome = reconcile_one(&engine, &key, reconcile_timeout).await;
        match outcome {
            ReconcileOutcome::Requeue(delay) => {
                queue.add_after(key.clone(), delay);
            }
            ReconcileOutcome::RequeueImmediate => {
                queue.add(key.clone()).await;
            }
            ReconcileOutcome::Converged | ReconcileOutcome::Fatal(_) => {}
        }
        queue.done(&key).await;
    }
    debug!(worker, "worker exiting");
}

async fn reconcile_one(
    engine: &ReconcileEngine,
    key: &ObjectKey,
    budget: Duration,
) -> ReconcileOutcome {
    match timeout(budget, engine.reconcile(key)).await {
        Ok(outcome) => outcome,
        // The attempt future was dropped before it could emit; record
        // the timeout as a transient failure.
        Err(_) => engine.timed_out(key).await,
    }
}
