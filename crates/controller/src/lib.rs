//! Level-triggered reconciliation controller for Deployables.
//!
//! The controller watches an object store for Deployable changes,
//! funnels keys through a deduplicating work queue, and runs a
//! reconcile engine that propagates each object's template to its
//! declared channels. Failures back off per key; convergence is
//! recorded on the object's status under optimistic concurrency.
//!
//! ```ignore
//! let registry = ChannelRegistry::new().with_channel("staging", propagator);
//! let (controller, mut observer) =
//!     Controller::new(store, registry, ControllerConfig::default());
//! let stopper = controller.stopper();
//! tokio::spawn(controller.run());
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod backoff;
pub mod controller;
pub mod engine;
pub mod error;
pub mod hook;
pub mod outcome;
pub mod propagate;
pub mod queue;
pub mod watcher;

pub use backoff::{BackoffConfig, BackoffTracker, MAX_IMMEDIATE_RETRIES};
pub use controller::{Controller, ControllerConfig, ControllerStopper};
pub use engine::{EngineConfig, ReconcileEngine};
pub use error::{Error, Result};
pub use hook::{CompletedReconcile, ReconcileHook, ReconcileObserver};
pub use outcome::ReconcileOutcome;
pub use propagate::{ChannelPropagator, ChannelRegistry, PropagationOutcome};
pub use queue::WorkQueue;
pub use watcher::EventWatcher;
