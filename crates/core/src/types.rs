//! Resource model for the convoy controller.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable identity of an object: namespace plus name.
///
/// Keys carry no payload. They are the unit of work-queue deduplication,
/// and every reconcile attempt re-reads the object behind the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Namespace the object lives in.
    pub namespace: String,
    /// Object name, unique within its namespace.
    pub name: String,
}

impl ObjectKey {
    /// Create a new key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Desired state of a Deployable: an opaque templated payload and the
/// set of channel names it should be propagated to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployableSpec {
    /// Opaque templated content handed to each channel propagator.
    pub template: Value,
    /// Target channels, by registered name.
    pub channels: Vec<String>,
}

impl DeployableSpec {
    /// Create a spec with no target channels.
    pub fn new(template: Value) -> Self {
        Self {
            template,
            channels: Vec::new(),
        }
    }

    /// Add a target channel.
    #[must_use]
    pub fn with_channel(mut self, name: impl Into<String>) -> Self {
        self.channels.push(name.into());
        self
    }

    /// Check the spec for structural problems that no retry can fix.
    ///
    /// An empty channel set is not structural: such a Deployable is
    /// trivially converged.
    pub fn structural_error(&self) -> Option<String> {
        if !self.template.is_object() {
            return Some("template must be a JSON object".to_string());
        }
        None
    }
}

/// Per-channel propagation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropagationState {
    /// Not yet attempted at the current version.
    Pending,
    /// Payload delivered to the channel.
    Propagated,
    /// Last attempt failed transiently; a retry is scheduled.
    Retrying,
    /// Last attempt failed permanently; no retry until the spec changes.
    Failed,
}

/// Status of one channel, as of the spec version it was last attempted at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatus {
    /// Propagation state.
    pub state: PropagationState,
    /// Failure reason, if any.
    pub reason: Option<String>,
    /// Spec resource version the last attempt observed.
    pub at_version: u64,
    /// When this condition was last written.
    pub last_update: DateTime<Utc>,
}

impl ChannelStatus {
    /// Channel successfully propagated at `version`.
    pub fn propagated(version: u64) -> Self {
        Self {
            state: PropagationState::Propagated,
            reason: None,
            at_version: version,
            last_update: Utc::now(),
        }
    }

    /// Channel failed transiently at `version`.
    pub fn retrying(version: u64, reason: impl Into<String>) -> Self {
        Self {
            state: PropagationState::Retrying,
            reason: Some(reason.into()),
            at_version: version,
            last_update: Utc::now(),
        }
    }

    /// Channel failed permanently at `version`.
    pub fn failed(version: u64, reason: impl Into<String>) -> Self {
        Self {
            state: PropagationState::Failed,
            reason: Some(reason.into()),
            at_version: version,
            last_update: Utc::now(),
        }
    }

    /// Whether this channel needs no further attempt at `version`.
    ///
    /// Propagated and permanently Failed conditions are settled; only a
    /// spec change (version bump) re-opens them.
    pub fn settled_at(&self, version: u64) -> bool {
        self.at_version == version
            && matches!(
                self.state,
                PropagationState::Propagated | PropagationState::Failed
            )
    }
}

/// Overall phase of a Deployable, derived from its channel conditions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeployablePhase {
    /// No reconcile attempt recorded yet.
    #[default]
    Pending,
    /// Some channels are still retrying.
    Propagating,
    /// All channels propagated at the current version.
    Propagated,
    /// Structurally invalid spec or permanent channel failures.
    Failed,
}

/// Observed state of a Deployable, written only by the reconcile engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployableStatus {
    /// Overall phase.
    pub phase: DeployablePhase,
    /// Reason for a Failed phase, if any.
    pub reason: Option<String>,
    /// Spec resource version of the last completed reconcile. When this
    /// matches the object's current version the engine short-circuits.
    pub last_reconciled_version: Option<u64>,
    /// Per-channel conditions.
    pub channels: BTreeMap<String, ChannelStatus>,
}

impl DeployableStatus {
    /// Get the condition for a channel.
    pub fn channel(&self, name: &str) -> Option<&ChannelStatus> {
        self.channels.get(name)
    }
}

/// The desired-state resource the controller converges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployable {
    /// Stable identity.
    pub key: ObjectKey,
    /// Monotonic per-object version, bumped on every spec mutation.
    /// Status writes do not bump it.
    pub resource_version: u64,
    /// Desired state.
    pub spec: DeployableSpec,
    /// Observed state.
    pub status: DeployableStatus,
}

impl Deployable {
    /// Create a new Deployable at version 1 with empty status.
    pub fn new(key: ObjectKey, spec: DeployableSpec) -> Self {
        Self {
            key,
            resource_version: 1,
            spec,
            status: DeployableStatus::default(),
        }
    }
}
