//! K8s-style change propagation from configuration resources to their dependents.
//!
//! When the content of a shared configuration resource changes, every
//! dependent in the same namespace that references it by name and records
//! an older version receives an empty patch. The patch carries no fields;
//! it only makes the API's defaulting logic re-stamp the reference.
//!
//! # Flow
//!
//! 1. [`ChangeFilter`] drops updates whose content did not change and
//!    enqueues the key of everything else.
//! 2. [`WorkQueue`] deduplicates keys, never hands the same key to two
//!    workers, and backs off failed keys.
//! 3. [`Controller`] workers pop keys and call [`Reconciler::reconcile_with`]:
//!    fetch the resource, list dependents through [`DependencyResolver`],
//!    classify each with [`staleness::classify`], and fire a
//!    [`CascadeTrigger`] for the stale ones.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use confcascade_core::ControllerConfig;
//! use confcascade_reconciler::{Controller, InMemoryCluster, Notification, Reconciler};
//!
//! #[tokio::main]
//! async fn main() -> confcascade_reconciler::Result<()> {
//!     let config = ControllerConfig::default();
//!     let cluster = Arc::new(InMemoryCluster::new());
//!     let reconciler = Arc::new(Reconciler::for_api(cluster.clone(), &config));
//!     let controller = Controller::new(reconciler, config)?;
//!
//!     let filter = controller.filter();
//!     // Wire `filter.on_notify` into the watch stream, then:
//!     controller.run().await;
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod filter;
pub mod r#loop;
pub mod queue;
pub mod reconciler;
pub mod resolver;
pub mod staleness;
pub mod store;
pub mod trigger;
pub mod types;

// Re-export main types
pub use error::{Error, Result};
pub use filter::{content_changed, ChangeFilter};
pub use r#loop::{Controller, ControllerHandle};
pub use queue::{ItemBackoff, WorkQueue};
pub use reconciler::{ReconcileContext, Reconciler, ReconcilerBuilder};
pub use resolver::{extract_reference, DependencyResolver};
pub use staleness::{classify, is_stale};
pub use store::{InMemoryCluster, ResourceReader, ResourceWriter};
pub use trigger::{CascadeTrigger, EmptyPatchTrigger, TriggerOutcome};
pub use types::{
    Notification, ReconcileOutcome, ReferencingDependent, Resolution, Staleness,
};
