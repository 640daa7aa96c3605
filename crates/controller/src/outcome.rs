//! Result of a single reconcile attempt.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Outcome of one reconcile attempt for one key.
///
/// Produced once per attempt, consumed by the worker loop (to decide
/// requeueing) and by the observability hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileOutcome {
    /// Observed state matches desired state; nothing left to do.
    Converged,
    /// Transient failure; retry after the backoff-computed delay.
    Requeue(Duration),
    /// Detected race (version conflict); retry without backoff.
    RequeueImmediate,
    /// Structurally invalid desired state; recorded in status, no
    /// automatic retry until the spec changes.
    Fatal(String),
}

impl ReconcileOutcome {
    /// Whether this outcome requires no further work.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    /// Whether this outcome schedules another attempt.
    pub fn requeues(&self) -> bool {
        matches!(self, Self::Requeue(_) | Self::RequeueImmediate)
    }
}
