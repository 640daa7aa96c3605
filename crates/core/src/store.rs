//! Object store trait and in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::error::{Error as CoreError, Result};
use crate::types::{Deployable, DeployableSpec, DeployableStatus, ObjectKey};

/// Kind of change a watch event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// Object was created.
    Added,
    /// Object spec was updated.
    Updated,
    /// Object was deleted.
    Deleted,
}

/// A change notification. Carries the key only; consumers re-read the
/// object to observe current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    /// What happened.
    pub event_type: EventType,
    /// Which object it happened to.
    pub key: ObjectKey,
}

/// Error receiving from a watch subscription.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WatchRecvError {
    /// The subscriber fell behind and `missed` events were dropped.
    /// Consumers should resync by re-listing.
    #[error("watch stream lagged, {missed} events dropped")]
    Lagged { missed: u64 },
    /// The store side of the stream is gone.
    #[error("watch stream closed")]
    Closed,
}

/// Subscription handle for receiving watch events.
pub struct WatchSubscription {
    receiver: broadcast::Receiver<WatchEvent>,
}

impl WatchSubscription {
    /// Receive the next event.
    pub async fn recv(&mut self) -> std::result::Result<WatchEvent, WatchRecvError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Lagged(missed) => WatchRecvError::Lagged { missed },
            broadcast::error::RecvError::Closed => WatchRecvError::Closed,
        })
    }
}

/// Result of a conditional status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWriteResult {
    /// Status written; the precondition held.
    Applied,
    /// The stored version no longer matches the expected one.
    VersionConflict {
        /// Version currently stored.
        current: u64,
    },
    /// The object was deleted between read and write.
    NotFound,
}

/// Trait for versioned object storage with change notifications.
///
/// The store is the single source of truth. Reconcile attempts read
/// through it on every run and write back only the status sub-object,
/// guarded by an expected resource version.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read an object by key. `None` means deleted or never created.
    async fn get(&self, key: &ObjectKey) -> Result<Option<Deployable>>;

    /// List the keys of all stored objects.
    async fn list_keys(&self) -> Result<Vec<ObjectKey>>;

    /// Conditionally write an object's status.
    ///
    /// The write applies only if the stored resource version still equals
    /// `expected_version`. Status writes never bump the resource version.
    async fn update_status(
        &self,
        key: &ObjectKey,
        status: DeployableStatus,
        expected_version: u64,
    ) -> Result<StatusWriteResult>;

    /// Subscribe to change notifications.
    fn watch(&self) -> WatchSubscription;
}

/// In-memory object store for testing and embedding.
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<ObjectKey, Deployable>>,
    events: broadcast::Sender<WatchEvent>,
}

impl InMemoryObjectStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            objects: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Create a Deployable. Fails if the key is already taken.
    pub async fn create(&self, deployable: Deployable) -> Result<()> {
        let key = deployable.key.clone();
        let mut objects = self.objects.write().await;
        if objects.contains_key(&key) {
            return Err(CoreError::object_exists(key.to_string()));
        }
        objects.insert(key.clone(), deployable);
        drop(objects);

        debug!(key = %key, "object created");
        let _ = self.events.send(WatchEvent {
            event_type: EventType::Added,
            key,
        });
        Ok(())
    }

    /// Replace a Deployable's spec, bumping its resource version.
    /// Returns the new version.
    pub async fn update_spec(&self, key: &ObjectKey, spec: DeployableSpec) -> Result<u64> {
        let mut objects = self.objects.write().await;
        let object = objects
            .get_mut(key)
            .ok_or_else(|| CoreError::object_not_found(key.to_string()))?;
        object.spec = spec;
        object.resource_version = object.resource_version.saturating_add(1);
        let version = object.resource_version;
        drop(objects);

        debug!(key = %key, version, "spec updated");
        let _ = self.events.send(WatchEvent {
            event_type: EventType::Updated,
            key: key.clone(),
        });
        Ok(version)
    }

    /// Delete a Deployable.
    pub async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let mut objects = self.objects.write().await;
        if objects.remove(key).is_none() {
            return Err(CoreError::object_not_found(key.to_string()));
        }
        drop(objects);

        debug!(key = %key, "object deleted");
        let _ = self.events.send(WatchEvent {
            event_type: EventType::Deleted,
            key: key.clone(),
        });
        Ok(())
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Deployable>> {
        let objects = self.objects.read().await;
        Ok(objects.get(key).cloned())
    }

    async fn list_keys(&self) -> Result<Vec<ObjectKey>> {
        let objects = self.objects.read().await;
        Ok(objects.keys().cloned().collect())
    }

    async fn update_status(
        &self,
        key: &ObjectKey,
        status: DeployableStatus,
        expected_version: u64,
    ) -> Result<StatusWriteResult> {
        let mut objects = self.objects.write().await;
        let Some(object) = objects.get_mut(key) else {
            return Ok(StatusWriteResult::NotFound);
        };
        if object.resource_version != expected_version {
            return Ok(StatusWriteResult::VersionConflict {
                current: object.resource_version,
            });
        }
        object.status = status;
        Ok(StatusWriteResult::Applied)
    }

    fn watch(&self) -> WatchSubscription {
        WatchSubscription {
            receiver: self.events.subscribe(),
        }
    }
}
