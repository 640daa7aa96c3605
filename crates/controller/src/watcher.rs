//! Event watcher: translates store notifications into work-queue adds.

use std::sync::Arc;

use convoy_core::{ObjectStore, WatchRecvError, WatchSubscription};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::queue::WorkQueue;

/// Forwards watch events to the work queue.
///
/// Pure translation: every Added/Updated/Deleted event becomes an
/// idempotent `add(key)`. The watcher never performs business logic and
/// never waits on reconciliation, so the watch stream cannot be blocked
/// by slow reconciles.
pub struct EventWatcher {
    store: Arc<dyn ObjectStore>,
    subscription: WatchSubscription,
    queue: Arc<WorkQueue>,
    stop_rx: watch::Receiver<bool>,
}

impl EventWatcher {
    /// Create a watcher. The subscription starts here, so events fired
    /// between construction and `spawn` are not lost.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        queue: Arc<WorkQueue>,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        let subscription = store.watch();
        Self {
            store,
            subscription,
            queue,
            stop_rx,
        }
    }

    /// Spawn the watcher task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!("watch started");

        loop {
            tokio::select! {
                event = self.subscription.recv() => match event {
                    Ok(event) => {
                        debug!(key = %event.key, kind = ?event.event_type, "watch event");
                        self.queue.add(event.key).await;
                    }
                    Err(WatchRecvError::Lagged { missed }) => {
                        warn!(missed, "watch stream lagged, resyncing all keys");
                        self.resync().await;
                    }
                    Err(WatchRecvError::Closed) => {
                        info!("watch stream closed");
                        break;
                    }
                },
                changed = self.stop_rx.changed() => {
                    if changed.is_err() || *self.stop_rx.borrow() {
                        info!("watch stopped");
                        break;
                    }
                }
            }
        }
    }

    /// Level-triggered recovery: enqueue every stored key. Missed events
    /// are harmless because each reconcile re-reads current state.
    async fn resync(&self) {
        match self.store.list_keys().await {
            Ok(keys) => {
                for key in keys {
                    self.queue.add(key).await;
                }
            }
            Err(e) => {
                error!(error = %e, "resync list failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::{Deployable, DeployableSpec, InMemoryObjectStore, ObjectKey};
    use serde_json::json;
    use std::time::Duration;

    fn sample(name: &str) -> Deployable {
        let spec = DeployableSpec::new(json!({"image": "web:v1"})).with_channel("staging");
        Deployable::new(ObjectKey::new("ns", name), spec)
    }

    #[tokio::test]
    async fn test_events_become_queue_adds() {
        let store = Arc::new(InMemoryObjectStore::new());
        let queue = Arc::new(WorkQueue::new());
        let (_stop_tx, stop_rx) = watch::channel(false);

        let handle =
            EventWatcher::new(store.clone() as Arc<dyn ObjectStore>, queue.clone(), stop_rx)
                .spawn();

        store.create(sample("app")).await.ok();

        let got = tokio::time::timeout(Duration::from_secs(1), queue.get()).await;
        assert_eq!(got.ok().flatten(), Some(ObjectKey::new("ns", "app")));

        handle.abort();
    }

    #[tokio::test]
    async fn test_delete_event_still_enqueues() {
        let store = Arc::new(InMemoryObjectStore::new());
        let queue = Arc::new(WorkQueue::new());
        let (_stop_tx, stop_rx) = watch::channel(false);

        let handle =
            EventWatcher::new(store.clone() as Arc<dyn ObjectStore>, queue.clone(), stop_rx)
                .spawn();

        let object = sample("app");
        let key = object.key.clone();
        store.create(object).await.ok();
        store.delete(&key).await.ok();

        // Added and Deleted both arrive; dedup collapses them into at
        // least one pending enqueue.
        let got = tokio::time::timeout(Duration::from_secs(1), queue.get()).await;
        assert_eq!(got.ok().flatten(), Some(key));

        handle.abort();
    }

    #[tokio::test]
    async fn test_lagged_stream_resyncs_all_keys() {
        let store = Arc::new(InMemoryObjectStore::new());
        let queue = Arc::new(WorkQueue::new());
        let (_stop_tx, stop_rx) = watch::channel(false);

        // Subscribe first, then overflow the broadcast buffer before the
        // watcher task gets a chance to read: the first recv lags.
        let watcher =
            EventWatcher::new(store.clone() as Arc<dyn ObjectStore>, queue.clone(), stop_rx);
        let total = 400usize;
        for i in 0..total {
            store.create(sample(&format!("app-{i}"))).await.ok();
        }
        let handle = watcher.spawn();

        // The relist recovers every stored key, including the ones whose
        // events were dropped.
        let mut seen = std::collections::HashSet::new();
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while seen.len() < total {
                if let Some(key) = queue.get().await {
                    seen.insert(key.clone());
                    queue.done(&key).await;
                }
            }
        })
        .await;
        assert!(drained.is_ok(), "all keys should be enqueued after a lag");

        handle.abort();
    }

    #[tokio::test]
    async fn test_stop_signal_terminates_watcher() {
        let store = Arc::new(InMemoryObjectStore::new());
        let queue = Arc::new(WorkQueue::new());
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle =
            EventWatcher::new(store as Arc<dyn ObjectStore>, queue, stop_rx).spawn();

        stop_tx.send(true).ok();

        let joined = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(joined.is_ok(), "watcher should stop within timeout");
    }
}
