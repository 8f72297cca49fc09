//! Error types for the reconciler crate.

use itertools::Itertools;
use thiserror::Error;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
///
/// Three classes matter to the caller: not-found is benign and terminal,
/// invalid keys and configs are never retried, everything else is retryable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Object does not exist (deleted before or during processing).
    #[error("{kind} '{key}' not found")]
    NotFound { kind: String, key: String },

    /// Read or write against the API failed.
    #[error("{operation} failed: {reason}")]
    Api { operation: String, reason: String },

    /// A dependent's reference field could not be read.
    #[error("dependent '{dependent}' has a malformed reference: {reason}")]
    MalformedReference { dependent: String, reason: String },

    /// One or more cascade triggers failed during a pass.
    #[error("cascade trigger failed for {}", format_failures(.failures))]
    TriggerFailed { failures: Vec<(String, String)> },

    /// The controller stopped while the reconciliation was in flight.
    #[error("reconciliation cancelled")]
    Cancelled,

    /// The per-call deadline expired.
    #[error("reconciliation exceeded its {timeout_ms}ms deadline")]
    DeadlineExceeded { timeout_ms: u64 },

    /// Core error (keys, config).
    #[error(transparent)]
    Core(#[from] confcascade_core::Error),
}

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(dependent, reason)| format!("'{dependent}' ({reason})"))
        .join(", ")
}

impl Error {
    /// Create a not found error.
    pub fn not_found(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            key: key.into(),
        }
    }

    /// Create an API error.
    pub fn api(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Api {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a malformed reference error.
    pub fn malformed_reference(dependent: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedReference {
            dependent: dependent.into(),
            reason: reason.into(),
        }
    }

    /// Create a deadline exceeded error.
    pub const fn deadline_exceeded(timeout_ms: u64) -> Self {
        Self::DeadlineExceeded { timeout_ms }
    }

    /// Whether this is the benign "object is gone" outcome.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether redelivering the key could succeed.
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotFound { .. } | Self::Core(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_terminal() {
        let err = Error::not_found("ConfigurationResource", "ns/cfg");
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("ns/cfg"));
    }

    #[test]
    fn test_io_failures_are_retryable() {
        assert!(Error::api("get ns/cfg", "connection reset").is_retryable());
        assert!(Error::Cancelled.is_retryable());
        assert!(Error::deadline_exceeded(10).is_retryable());
        assert!(Error::malformed_reference("ns/dep", "name is not a string").is_retryable());
    }

    #[test]
    fn test_invalid_key_is_not_retryable() {
        let err: Error = confcascade_core::Error::invalid_key("a/b/c", "bad").into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_trigger_failed_lists_dependents() {
        let err = Error::TriggerFailed {
            failures: vec![
                ("ns/a".to_string(), "timeout".to_string()),
                ("ns/b".to_string(), "conflict".to_string()),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("'ns/a' (timeout)"));
        assert!(msg.contains("'ns/b' (conflict)"));
    }
}
