//! Reconcile engine: the per-key convergence state machine.

use std::sync::Arc;
use std::time::Duration;

use convoy_core::{
    ChannelStatus, Deployable, DeployablePhase, ObjectKey, ObjectStore, PropagationState,
    StatusWriteResult,
};
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::backoff::{BackoffTracker, RetryDecision};
use crate::hook::ReconcileHook;
use crate::outcome::ReconcileOutcome;
use crate::propagate::{ChannelRegistry, PropagationOutcome};

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Timeout for a single channel propagation or release call.
    pub propagation_timeout: Duration,
    /// Bound on concurrent per-channel propagation attempts for one key.
    pub channel_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            propagation_timeout: Duration::from_secs(10),
            channel_concurrency: 4,
        }
    }
}

/// Drives one Deployable toward its desired state per attempt.
///
/// The engine is stateless between attempts: every reconcile re-reads the
/// object from the store, which is what makes duplicate and out-of-order
/// deliveries safe. Status is the only thing it writes, always guarded by
/// the resource version it read.
pub struct ReconcileEngine {
    store: Arc<dyn ObjectStore>,
    channels: Arc<ChannelRegistry>,
    backoff: Arc<BackoffTracker>,
    hook: ReconcileHook,
    config: EngineConfig,
}

impl ReconcileEngine {
    /// Create an engine.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        channels: Arc<ChannelRegistry>,
        backoff: Arc<BackoffTracker>,
        hook: ReconcileHook,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            channels,
            backoff,
            hook,
            config,
        }
    }

    /// Run one reconcile attempt for `key`.
    ///
    /// Emits the outcome to the observability hook exactly once, and
    /// clears the key's backoff bookkeeping on convergence.
    pub async fn reconcile(&self, key: &ObjectKey) -> ReconcileOutcome {
        debug!(key = %key, "reconciling");
        let outcome = self.attempt(key).await;
        if outcome.is_converged() {
            self.backoff.forget(key).await;
        }
        self.hook.emit(key.clone(), outcome.clone());
        outcome
    }

    /// Record an attempt that exceeded the per-reconcile timeout.
    ///
    /// The worker calls this after cancelling the attempt; it counts as a
    /// transient failure and carries the hook emission for the attempt.
    pub async fn timed_out(&self, key: &ObjectKey) -> ReconcileOutcome {
        warn!(key = %key, "reconcile attempt timed out");
        let outcome = ReconcileOutcome::Requeue(self.backoff.next_delay(key).await);
        self.hook.emit(key.clone(), outcome.clone());
        outcome
    }

    async fn attempt(&self, key: &ObjectKey) -> ReconcileOutcome {
        let object = match self.store.get(key).await {
            Ok(Some(object)) => object,
            Ok(None) => {
                debug!(key = %key, "object gone, running cleanup");
                self.cleanup(key).await;
                return ReconcileOutcome::Converged;
            }
            Err(e) => {
                error!(key = %key, error = %e, "fetch failed");
                return ReconcileOutcome::Requeue(self.backoff.next_delay(key).await);
            }
        };

        let version = object.resource_version;
        if object.status.last_reconciled_version == Some(version) {
            debug!(key = %key, version, "already reconciled, short-circuiting");
            return ReconcileOutcome::Converged;
        }

        if let Some(reason) = object.spec.structural_error() {
            warn!(key = %key, version, reason = %reason, "structurally invalid spec");
            let mut status = object.status.clone();
            status.phase = DeployablePhase::Failed;
            status.reason = Some(reason.clone());
            status.last_reconciled_version = Some(version);
            return self
                .persist(key, status, version, ReconcileOutcome::Fatal(reason))
                .await;
        }

        // Propagate to every channel not yet settled at this version.
        // Attempts are independent: one channel's failure never rolls
        // back another's success.
        let pending: Vec<String> = object
            .spec
            .channels
            .iter()
            .filter(|name| {
                object
                    .status
                    .channel(name)
                    .map_or(true, |c| !c.settled_at(version))
            })
            .cloned()
            .collect();

        let attempts: Vec<(String, PropagationOutcome)> = stream::iter(
            pending
                .into_iter()
                .map(|name| self.propagate_one(&object, name)),
        )
        .buffer_unordered(self.config.channel_concurrency.max(1))
        .collect()
        .await;

        let mut status = object.status.clone();
        status.reason = None;
        for (name, result) in attempts {
            let condition = match result {
                PropagationOutcome::Success => {
                    debug!(key = %key, channel = %name, version, "channel propagated");
                    ChannelStatus::propagated(version)
                }
                PropagationOutcome::TransientFailure(reason) => {
                    warn!(key = %key, channel = %name, reason = %reason, "transient propagation failure");
                    ChannelStatus::retrying(version, reason)
                }
                PropagationOutcome::PermanentFailure(reason) => {
                    warn!(key = %key, channel = %name, reason = %reason, "permanent propagation failure");
                    ChannelStatus::failed(version, reason)
                }
            };
            status.channels.insert(name, condition);
        }

        // Channels dropped from the spec no longer hold artifacts.
        let removed: Vec<String> = status
            .channels
            .keys()
            .filter(|name| !object.spec.channels.contains(*name))
            .cloned()
            .collect();
        for name in removed {
            status.channels.remove(&name);
            if let Some(propagator) = self.channels.get(&name) {
                self.release_one(key, &name, propagator.as_ref()).await;
            }
        }

        let retrying = status
            .channels
            .values()
            .any(|c| c.state == PropagationState::Retrying);
        let failed_summary = status
            .channels
            .iter()
            .filter(|(_, c)| c.state == PropagationState::Failed)
            .map(|(name, c)| {
                let reason = c.reason.clone().unwrap_or_default();
                format!("{name}: {reason}")
            })
            .join("; ");

        let on_applied = if retrying {
            status.phase = DeployablePhase::Propagating;
            ReconcileOutcome::Requeue(self.backoff.next_delay(key).await)
        } else if !failed_summary.is_empty() {
            status.phase = DeployablePhase::Failed;
            status.reason = Some(failed_summary.clone());
            status.last_reconciled_version = Some(version);
            ReconcileOutcome::Fatal(failed_summary)
        } else {
            status.phase = DeployablePhase::Propagated;
            status.last_reconciled_version = Some(version);
            ReconcileOutcome::Converged
        };

        self.persist(key, status, version, on_applied).await
    }

    async fn propagate_one(
        &self,
        object: &Deployable,
        name: String,
    ) -> (String, PropagationOutcome) {
        let outcome = match self.channels.get(&name) {
            None => PropagationOutcome::PermanentFailure(format!(
                "channel '{name}' is not registered"
            )),
            Some(propagator) => {
                let attempt = propagator.propagate(&object.key, &object.spec.template);
                match timeout(self.config.propagation_timeout, attempt).await {
                    Ok(outcome) => outcome,
                    Err(_) => PropagationOutcome::TransientFailure(format!(
                        "propagation timed out after {}ms",
                        self.config.propagation_timeout.as_millis()
                    )),
                }
            }
        };
        (name, outcome)
    }

    /// Persist status with the expected-version precondition and map the
    /// write result onto the attempt's outcome.
    async fn persist(
        &self,
        key: &ObjectKey,
        status: convoy_core::DeployableStatus,
        expected_version: u64,
        on_applied: ReconcileOutcome,
    ) -> ReconcileOutcome {
        match self.store.update_status(key, status, expected_version).await {
            Ok(StatusWriteResult::Applied) => on_applied,
            Ok(StatusWriteResult::VersionConflict { current }) => {
                debug!(
                    key = %key,
                    expected = expected_version,
                    current,
                    "status write lost a version race"
                );
                match self.backoff.conflict_decision(key).await {
                    RetryDecision::Immediate => ReconcileOutcome::RequeueImmediate,
                    RetryDecision::Delayed(delay) => ReconcileOutcome::Requeue(delay),
                }
            }
            Ok(StatusWriteResult::NotFound) => {
                debug!(key = %key, "object deleted mid-reconcile, running cleanup");
                self.cleanup(key).await;
                ReconcileOutcome::Converged
            }
            Err(e) => {
                error!(key = %key, error = %e, "status write failed");
                ReconcileOutcome::Requeue(self.backoff.next_delay(key).await)
            }
        }
    }

    /// Deletion path: release propagation artifacts on every registered
    /// channel. Best-effort; failures are logged, the key is dropped
    /// either way.
    async fn cleanup(&self, key: &ObjectKey) {
        for (name, propagator) in self.channels.iter() {
            self.release_one(key, name, propagator.as_ref()).await;
        }
    }

    async fn release_one(
        &self,
        key: &ObjectKey,
        name: &str,
        propagator: &dyn crate::propagate::ChannelPropagator,
    ) {
        match timeout(self.config.propagation_timeout, propagator.release(key)).await {
            Ok(PropagationOutcome::Success) => {
                debug!(key = %key, channel = name, "released propagation artifacts");
            }
            Ok(PropagationOutcome::TransientFailure(reason))
            | Ok(PropagationOutcome::PermanentFailure(reason)) => {
                warn!(key = %key, channel = name, reason = %reason, "release failed");
            }
            Err(_) => {
                warn!(key = %key, channel = name, "release timed out");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffConfig;
    use crate::propagate::ChannelPropagator;
    use async_trait::async_trait;
    use convoy_core::{DeployableSpec, InMemoryObjectStore};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Propagator that returns a scripted outcome and counts calls.
    struct Scripted {
        outcome: PropagationOutcome,
        propagate_calls: AtomicU32,
        release_calls: AtomicU32,
    }

    impl Scripted {
        fn new(outcome: PropagationOutcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                propagate_calls: AtomicU32::new(0),
                release_calls: AtomicU32::new(0),
            })
        }

        fn ok() -> Arc<Self> {
            Self::new(PropagationOutcome::Success)
        }
    }

    #[async_trait]
    impl ChannelPropagator for Scripted {
        async fn propagate(&self, _key: &ObjectKey, _template: &Value) -> PropagationOutcome {
            self.propagate_calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }

        async fn release(&self, _key: &ObjectKey) -> PropagationOutcome {
            self.release_calls.fetch_add(1, Ordering::SeqCst);
            PropagationOutcome::Success
        }
    }

    fn engine_with(
        store: Arc<InMemoryObjectStore>,
        registry: ChannelRegistry,
    ) -> ReconcileEngine {
        let (hook, _observer) = ReconcileHook::channel(64);
        ReconcileEngine::new(
            store,
            Arc::new(registry),
            Arc::new(BackoffTracker::new(BackoffConfig::default())),
            hook,
            EngineConfig::default(),
        )
    }

    fn deployable(name: &str, channels: &[&str]) -> Deployable {
        let mut spec = DeployableSpec::new(json!({"image": "web:v1"}));
        for channel in channels {
            spec = spec.with_channel(*channel);
        }
        Deployable::new(ObjectKey::new("ns", name), spec)
    }

    #[tokio::test]
    async fn test_converges_and_short_circuits_second_run() {
        let store = Arc::new(InMemoryObjectStore::new());
        let staging = Scripted::ok();
        let registry = ChannelRegistry::new().with_channel("staging", staging.clone());
        let engine = engine_with(store.clone(), registry);

        let object = deployable("app", &["staging"]);
        let key = object.key.clone();
        store.create(object).await.ok();

        assert_eq!(engine.reconcile(&key).await, ReconcileOutcome::Converged);
        let first = store.get(&key).await.ok().flatten();

        // Second run is a no-op short circuit: no propagation, no write.
        assert_eq!(engine.reconcile(&key).await, ReconcileOutcome::Converged);
        let second = store.get(&key).await.ok().flatten();

        assert_eq!(staging.propagate_calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert_eq!(
            first.map(|d| d.status.phase),
            Some(DeployablePhase::Propagated)
        );
    }

    #[tokio::test]
    async fn test_missing_object_runs_cleanup() {
        let store = Arc::new(InMemoryObjectStore::new());
        let staging = Scripted::ok();
        let registry = ChannelRegistry::new().with_channel("staging", staging.clone());
        let engine = engine_with(store, registry);

        let key = ObjectKey::new("ns", "gone");
        assert_eq!(engine.reconcile(&key).await, ReconcileOutcome::Converged);
        assert_eq!(staging.release_calls.load(Ordering::SeqCst), 1);
        assert_eq!(staging.propagate_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_structural_error_is_fatal_then_quiescent() {
        let store = Arc::new(InMemoryObjectStore::new());
        let staging = Scripted::ok();
        let registry = ChannelRegistry::new().with_channel("staging", staging.clone());
        let engine = engine_with(store.clone(), registry);

        let spec = DeployableSpec::new(json!("not an object")).with_channel("staging");
        let object = Deployable::new(ObjectKey::new("ns", "bad"), spec);
        let key = object.key.clone();
        store.create(object).await.ok();

        let outcome = engine.reconcile(&key).await;
        assert!(matches!(outcome, ReconcileOutcome::Fatal(_)));
        assert_eq!(staging.propagate_calls.load(Ordering::SeqCst), 0);

        let stored = store.get(&key).await.ok().flatten();
        assert_eq!(
            stored.as_ref().map(|d| d.status.phase),
            Some(DeployablePhase::Failed)
        );
        assert_eq!(
            stored.and_then(|d| d.status.last_reconciled_version),
            Some(1)
        );

        // Redelivery of the same broken version does not hot-loop.
        assert_eq!(engine.reconcile(&key).await, ReconcileOutcome::Converged);
    }

    #[tokio::test]
    async fn test_unregistered_channel_fails_permanently() {
        let store = Arc::new(InMemoryObjectStore::new());
        let engine = engine_with(store.clone(), ChannelRegistry::new());

        let object = deployable("app", &["nowhere"]);
        let key = object.key.clone();
        store.create(object).await.ok();

        let outcome = engine.reconcile(&key).await;
        assert!(matches!(outcome, ReconcileOutcome::Fatal(_)));

        let stored = store.get(&key).await.ok().flatten();
        let condition = stored.and_then(|d| d.status.channel("nowhere").cloned());
        assert_eq!(
            condition.as_ref().map(|c| c.state),
            Some(PropagationState::Failed)
        );
        assert!(condition
            .and_then(|c| c.reason)
            .is_some_and(|r| r.contains("not registered")));
    }

    #[tokio::test]
    async fn test_transient_failure_requeues_with_backoff() {
        let store = Arc::new(InMemoryObjectStore::new());
        let flaky = Scripted::new(PropagationOutcome::TransientFailure(
            "connection reset".to_string(),
        ));
        let registry = ChannelRegistry::new().with_channel("staging", flaky);
        let engine = engine_with(store.clone(), registry);

        let object = deployable("app", &["staging"]);
        let key = object.key.clone();
        store.create(object).await.ok();

        let outcome = engine.reconcile(&key).await;
        assert!(matches!(outcome, ReconcileOutcome::Requeue(_)));

        let stored = store.get(&key).await.ok().flatten();
        assert_eq!(
            stored.as_ref().map(|d| d.status.phase),
            Some(DeployablePhase::Propagating)
        );
        assert_eq!(
            stored
                .as_ref()
                .and_then(|d| d.status.channel("staging"))
                .map(|c| c.state),
            Some(PropagationState::Retrying)
        );
        // Not recorded as reconciled: the next attempt retries.
        assert_eq!(
            stored.and_then(|d| d.status.last_reconciled_version),
            None
        );
    }

    #[tokio::test]
    async fn test_empty_channel_set_is_trivially_converged() {
        let store = Arc::new(InMemoryObjectStore::new());
        let engine = engine_with(store.clone(), ChannelRegistry::new());

        let object = deployable("app", &[]);
        let key = object.key.clone();
        store.create(object).await.ok();

        assert_eq!(engine.reconcile(&key).await, ReconcileOutcome::Converged);
        let stored = store.get(&key).await.ok().flatten();
        assert_eq!(
            stored.map(|d| d.status.phase),
            Some(DeployablePhase::Propagated)
        );
    }

    #[tokio::test]
    async fn test_channel_removed_from_spec_is_released() {
        let store = Arc::new(InMemoryObjectStore::new());
        let staging = Scripted::ok();
        let preview = Scripted::ok();
        let registry = ChannelRegistry::new()
            .with_channel("staging", staging.clone())
            .with_channel("preview", preview.clone());
        let engine = engine_with(store.clone(), registry);

        let object = deployable("app", &["staging", "preview"]);
        let key = object.key.clone();
        store.create(object).await.ok();
        assert_eq!(engine.reconcile(&key).await, ReconcileOutcome::Converged);

        // Drop the preview channel from the spec.
        let spec = DeployableSpec::new(json!({"image": "web:v1"})).with_channel("staging");
        store.update_spec(&key, spec).await.ok();
        assert_eq!(engine.reconcile(&key).await, ReconcileOutcome::Converged);

        assert_eq!(preview.release_calls.load(Ordering::SeqCst), 1);
        let stored = store.get(&key).await.ok().flatten();
        assert!(stored
            .is_some_and(|d| d.status.channel("preview").is_none()));
    }
}
