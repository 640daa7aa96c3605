//! Resource model and object-store interface for the convoy controller.
//!
//! This crate defines the versioned resource model the controller
//! converges and the storage seam it converges through:
//!
//! - **Deployable**: desired payload plus target channel set, identified
//!   by namespace/name and guarded by a monotonic resource version
//! - **Object store**: `get`/`list`/conditional `update_status` plus a
//!   watch stream of change notifications
//! - **In-memory store**: reference implementation used by tests and
//!   embedders
//!
//! # Example
//!
//! ```ignore
//! use convoy_core::{Deployable, DeployableSpec, InMemoryObjectStore, ObjectKey, ObjectStore};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(InMemoryObjectStore::new());
//!     let mut watch = store.watch();
//!
//!     let spec = DeployableSpec::new(json!({"image": "web:v1"})).with_channel("staging");
//!     store
//!         .create(Deployable::new(ObjectKey::new("team-a", "web"), spec))
//!         .await
//!         .unwrap();
//!
//!     let event = watch.recv().await.unwrap();
//!     println!("observed: {} {:?}", event.key, event.event_type);
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod error;
pub mod store;
pub mod types;

// Re-export main types
pub use error::{Error, Result};
pub use store::{
    EventType, InMemoryObjectStore, ObjectStore, StatusWriteResult, WatchEvent, WatchRecvError,
    WatchSubscription,
};
pub use types::{
    ChannelStatus, Deployable, DeployablePhase, DeployableSpec, DeployableStatus, ObjectKey,
    PropagationState,
};
