//! Observability hook: a stream of completed reconcile attempts.

use convoy_core::ObjectKey;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::outcome::ReconcileOutcome;

/// One completed reconcile attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedReconcile {
    /// Key that was reconciled.
    pub key: ObjectKey,
    /// How the attempt ended.
    pub outcome: ReconcileOutcome,
}

/// Producer side, held by the reconcile engine.
///
/// Emission never blocks: when the consumer falls behind the bounded
/// buffer, records are dropped and counted in a debug log rather than
/// stalling reconciliation.
#[derive(Clone)]
pub struct ReconcileHook {
    sender: mpsc::Sender<CompletedReconcile>,
}

impl ReconcileHook {
    /// Create a hook and its observer with the given buffer capacity.
    pub fn channel(capacity: usize) -> (Self, ReconcileObserver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, ReconcileObserver { receiver })
    }

    /// Emit a completed attempt.
    pub fn emit(&self, key: ObjectKey, outcome: ReconcileOutcome) {
        let record = CompletedReconcile { key, outcome };
        match self.sender.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                debug!(key = %record.key, "observer buffer full, dropping record");
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                debug!(key = %record.key, "observer gone, dropping record");
            }
        }
    }
}

/// Consumer side: read-only stream of completed attempts, used for test
/// synchronization and metrics export.
pub struct ReconcileObserver {
    receiver: mpsc::Receiver<CompletedReconcile>,
}

impl ReconcileObserver {
    /// Wait for the next completed attempt. `None` once all hooks are
    /// dropped.
    pub async fn recv(&mut self) -> Option<CompletedReconcile> {
        self.receiver.recv().await
    }

    /// Take the next completed attempt without waiting.
    pub fn try_recv(&mut self) -> Option<CompletedReconcile> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("ns", name)
    }

    #[tokio::test]
    async fn test_emit_and_recv() {
        let (hook, mut observer) = ReconcileHook::channel(8);

        hook.emit(key("app"), ReconcileOutcome::Converged);

        let record = observer.recv().await;
        assert_eq!(
            record,
            Some(CompletedReconcile {
                key: key("app"),
                outcome: ReconcileOutcome::Converged,
            })
        );
    }

    #[tokio::test]
    async fn test_overflow_drops_instead_of_blocking() {
        let (hook, mut observer) = ReconcileHook::channel(1);

        hook.emit(key("a"), ReconcileOutcome::Converged);
        hook.emit(key("b"), ReconcileOutcome::Converged);
        hook.emit(key("c"), ReconcileOutcome::Converged);

        // Only the first record fit; the rest were dropped, not queued.
        assert_eq!(observer.try_recv().map(|r| r.key), Some(key("a")));
        assert!(observer.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_emit_after_observer_dropped_is_silent() {
        let (hook, observer) = ReconcileHook::channel(4);
        drop(observer);

        // Must not panic or block.
        hook.emit(key("app"), ReconcileOutcome::RequeueImmediate);
    }
}
