//! Core types for the reconciler.

use std::fmt;

use confcascade_core::{ConfigurationResource, Dependent, ObjectKey, ReconcileKey, Reference};

/// A change notification for a configuration resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The resource was observed for the first time.
    Added(ConfigurationResource),
    /// The resource changed from `previous` to `current`.
    Updated {
        previous: ConfigurationResource,
        current: ConfigurationResource,
    },
}

impl Notification {
    /// Build an update notification.
    pub fn updated(previous: ConfigurationResource, current: ConfigurationResource) -> Self {
        Self::Updated { previous, current }
    }

    /// The latest snapshot carried by the notification.
    pub fn current(&self) -> &ConfigurationResource {
        match self {
            Self::Added(current) | Self::Updated { current, .. } => current,
        }
    }

    /// Short kind name for logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => "add",
            Self::Updated { .. } => "update",
        }
    }
}

/// A dependent whose reference names the configuration resource being reconciled.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferencingDependent {
    pub key: ObjectKey,
    pub dependent: Dependent,
    pub reference: Reference,
}

/// Dependents found for one configuration resource.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Dependents whose reference names the resource.
    pub referencing: Vec<ReferencingDependent>,
    /// Dependents with no reference or a reference to another resource.
    pub unrelated: usize,
    /// Dependents whose reference field could not be read.
    pub malformed: Vec<(String, String)>,
}

/// Staleness of a single reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    /// Recorded version differs from the current version.
    Stale,
    /// Recorded version matches.
    Current,
    /// The reference names a different resource.
    Unrelated,
}

/// What a single reconciliation pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The configuration resource no longer exists.
    Gone { key: ReconcileKey },
    /// The pass completed.
    Reconciled {
        key: ReconcileKey,
        /// Version the dependents were compared against.
        version: String,
        /// Dependents that received a cascade trigger.
        triggered: Vec<ObjectKey>,
        /// Dependents already recording `version`.
        current: usize,
        /// Dependents that reference something else, or nothing.
        unrelated: usize,
    },
}

impl ReconcileOutcome {
    /// Dependents triggered in this pass.
    pub fn triggered(&self) -> &[ObjectKey] {
        match self {
            Self::Gone { .. } => &[],
            Self::Reconciled { triggered, .. } => triggered,
        }
    }
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gone { key } => write!(f, "{key}: gone"),
            Self::Reconciled {
                key,
                version,
                triggered,
                current,
                unrelated,
            } => write!(
                f,
                "{key}@{version}: {} triggered, {current} current, {unrelated} unrelated",
                triggered.len()
            ),
        }
    }
}
