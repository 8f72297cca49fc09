//! Cascade trigger: an empty patch that makes the API re-default a dependent's reference.

use std::sync::Arc;

use async_trait::async_trait;
use confcascade_core::Dependent;
use tracing::{debug, info};

use crate::error::Result;
use crate::store::ResourceWriter;

/// Result of one trigger attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The empty patch was accepted.
    Sent,
    /// The dependent was deleted concurrently.
    Gone,
}

/// Sends cascade triggers.
#[async_trait]
pub trait CascadeTrigger: Send + Sync {
    /// Trigger a refresh of the dependent's recorded reference.
    ///
    /// # Errors
    ///
    /// Any write failure other than not-found.
    async fn trigger(&self, dependent: &Dependent) -> Result<TriggerOutcome>;
}

/// Trigger backed by an empty merge patch through a [`ResourceWriter`].
///
/// The patch carries no fields, so sending it repeatedly is harmless.
#[derive(Clone)]
pub struct EmptyPatchTrigger {
    writer: Arc<dyn ResourceWriter>,
}

impl EmptyPatchTrigger {
    /// Create a trigger over `writer`.
    pub fn new(writer: Arc<dyn ResourceWriter>) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl CascadeTrigger for EmptyPatchTrigger {
    async fn trigger(&self, dependent: &Dependent) -> Result<TriggerOutcome> {
        match self.writer.patch_empty(dependent).await {
            Ok(()) => {
                debug!(dependent = %dependent.metadata.name, "Sent empty patch");
                Ok(TriggerOutcome::Sent)
            }
            Err(e) if e.is_not_found() => {
                info!(
                    namespace = %dependent.metadata.namespace,
                    dependent = %dependent.metadata.name,
                    "Dependent is gone, skipping trigger"
                );
                Ok(TriggerOutcome::Gone)
            }
            Err(e) => Err(e),
        }
    }
}
