//! Deduplicating work queue with at-most-one-in-flight semantics.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use convoy_core::ObjectKey;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, trace};

struct QueueState {
    /// Keys waiting to be handed out, in arrival order.
    queue: VecDeque<ObjectKey>,
    /// Keys that are pending: queued, or re-added while in-flight.
    dirty: HashSet<ObjectKey>,
    /// Keys currently held by a `get()` caller.
    processing: HashSet<ObjectKey>,
    shutting_down: bool,
}

/// Deduplicating queue of reconcile keys.
///
/// Guarantees:
/// - `add` is idempotent: a key that is already pending is not enqueued
///   twice
/// - no key is handed to two concurrent `get()` holders
/// - a key re-added while in-flight is re-enqueued when `done` is called,
///   so the latest state is always eventually observed
pub struct WorkQueue {
    state: Mutex<QueueState>,
    /// One permit per queued item. Closed on shutdown to wake waiters.
    items: Semaphore,
}

impl WorkQueue {
    /// Create a new empty queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            items: Semaphore::new(0),
        }
    }

    /// Enqueue a key. No-op if the key is already pending or the queue is
    /// shut down. A key that is currently in-flight is marked dirty and
    /// re-enqueued by `done`.
    pub async fn add(&self, key: ObjectKey) {
        let mut state = self.state.lock().await;
        if state.shutting_down {
            trace!(key = %key, "add ignored, queue shut down");
            return;
        }
        if !state.dirty.insert(key.clone()) {
            trace!(key = %key, "add deduplicated");
            return;
        }
        if state.processing.contains(&key) {
            // Re-enqueued by done() once the in-flight attempt completes.
            debug!(key = %key, "key re-added while in-flight");
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.items.add_permits(1);
    }

    /// Schedule a delayed enqueue.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            queue.add(key).await;
        });
    }

    /// Wait for the next key, marking it in-flight.
    ///
    /// Returns `None` once the queue is shut down; callers must stop
    /// pulling.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let permit = self.items.acquire().await.ok()?;
            permit.forget();

            let mut state = self.state.lock().await;
            if let Some(key) = state.queue.pop_front() {
                state.dirty.remove(&key);
                state.processing.insert(key.clone());
                return Some(key);
            }
            // Permits track queued items one-to-one; an empty pop means
            // the queue is draining into shutdown.
            if state.shutting_down {
                return None;
            }
        }
    }

    /// Mark an in-flight key complete. If the key was re-added while
    /// in-flight it is immediately re-enqueued.
    pub async fn done(&self, key: &ObjectKey) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            debug!(key = %key, "re-enqueueing dirty key");
            state.queue.push_back(key.clone());
            drop(state);
            self.items.add_permits(1);
        }
    }

    /// Stop intake and wake all `get()` waiters.
    pub async fn shut_down(&self) {
        let mut state = self.state.lock().await;
        state.shutting_down = true;
        drop(state);
        self.items.close();
    }

    /// Number of keys waiting to be handed out.
    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Whether no keys are waiting.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}
