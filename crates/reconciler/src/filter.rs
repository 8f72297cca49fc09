//! Change filter: turns notifications into queued reconcile keys.

use confcascade_core::{ConfigurationResource, ReconcileKey};
use tracing::{debug, error};

use crate::queue::WorkQueue;
use crate::types::Notification;

/// Whether an update changed content that dependents care about.
///
/// Only the content blob counts. Version markers and metadata (labels,
/// annotations) are ignored, and an absent blob equals an empty one.
pub fn content_changed(previous: &ConfigurationResource, current: &ConfigurationResource) -> bool {
    previous.content() != current.content()
}

/// Notification callback bound to a work queue.
///
/// Safe to call from any thread; it never blocks.
#[derive(Debug, Clone)]
pub struct ChangeFilter {
    queue: WorkQueue<ReconcileKey>,
}

impl ChangeFilter {
    /// Create a filter feeding `queue`.
    pub const fn new(queue: WorkQueue<ReconcileKey>) -> Self {
        Self { queue }
    }

    /// Handle one notification. Returns whether a key was enqueued.
    pub fn on_notify(&self, notification: &Notification) -> bool {
        if let Notification::Updated { previous, current } = notification {
            if !content_changed(previous, current) {
                debug!(
                    namespace = %current.metadata.namespace,
                    name = %current.metadata.name,
                    "No content change, not requeueing"
                );
                return false;
            }
        }

        match notification.current().key() {
            Ok(key) => {
                debug!(key = %key, kind = notification.kind(), "Enqueued configuration resource");
                self.queue.add(key);
                true
            }
            Err(e) => {
                error!(error = %e, kind = notification.kind(), "Couldn't derive key, dropping notification");
                false
            }
        }
    }
}
