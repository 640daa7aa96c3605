//! Channel propagation seam.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use convoy_core::ObjectKey;
use serde_json::Value;

/// Result of one propagation attempt against one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropagationOutcome {
    /// The payload is in place at the target.
    Success,
    /// Delivery failed but may succeed on retry (timeout, transient I/O).
    TransientFailure(String),
    /// Delivery can never succeed for this payload (rejected, malformed
    /// for the target).
    PermanentFailure(String),
}

/// A named propagation target.
///
/// Implementations deliver the opaque template to wherever the channel
/// points (a registry, a git-like source, another cluster) and release
/// delivered artifacts when the owning Deployable is gone. Both
/// operations must be idempotent: the engine may call them again for
/// state that was already applied.
#[async_trait]
pub trait ChannelPropagator: Send + Sync {
    /// Deliver `template` for the object identified by `key`.
    async fn propagate(&self, key: &ObjectKey, template: &Value) -> PropagationOutcome;

    /// Remove anything previously delivered for `key`.
    async fn release(&self, key: &ObjectKey) -> PropagationOutcome;
}

/// Closed set of channels known to the controller, by name.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, Arc<dyn ChannelPropagator>>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a propagator under `name`, replacing any previous one.
    #[must_use]
    pub fn with_channel(
        mut self,
        name: impl Into<String>,
        propagator: Arc<dyn ChannelPropagator>,
    ) -> Self {
        self.channels.insert(name.into(), propagator);
        self
    }

    /// Look up a propagator by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ChannelPropagator>> {
        self.channels.get(name)
    }

    /// Iterate over all registered channels.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn ChannelPropagator>)> {
        self.channels.iter().map(|(n, p)| (n.as_str(), p))
    }

    /// Number of registered channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
