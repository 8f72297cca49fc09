//! Controller configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::resource::LabelSelector;

/// Default location of the reference inside a dependent's spec.
pub const DEFAULT_REFERENCE_PATH: &str =
    "/kubernetes/kubeAPIServer/auditConfig/auditPolicy/configMapRef";

/// Top-level controller configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Number of parallel workers draining the queue.
    pub workers: usize,
    /// Deadline for a single reconciliation, in milliseconds.
    pub reconcile_timeout_ms: u64,
    /// Retry behaviour for failed keys.
    pub retry: RetryConfig,
    /// Where and how to find references on dependents.
    pub reference: ReferenceConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            reconcile_timeout_ms: 30_000,
            retry: RetryConfig::default(),
            reference: ReferenceConfig::default(),
        }
    }
}

/// Per-key exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Cap on the backoff, in milliseconds.
    pub max_delay_ms: u64,
    /// Consecutive requeues before a key is dropped. `0` means never drop.
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5,
            max_delay_ms: 300_000,
            max_retries: 15,
        }
    }
}

impl RetryConfig {
    /// Delay before the first retry.
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Backoff cap.
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Whether a key that has already been requeued `requeues` times may be requeued again.
    pub const fn allows_retry(&self, requeues: u32) -> bool {
        self.max_retries == 0 || requeues < self.max_retries
    }
}

/// Reference lookup on dependents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    /// JSON pointer, relative to the dependent's spec.
    pub field_path: String,
    /// Selector applied when listing dependents.
    pub selector: LabelSelector,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            field_path: DEFAULT_REFERENCE_PATH.to_string(),
            selector: LabelSelector::everything(),
        }
    }
}

impl ControllerConfig {
    /// Parse a config from TOML and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TomlParseFailed`] for malformed TOML and
    /// [`Error::InvalidConfig`] when validation fails.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(input).map_err(|e| Error::toml_parse_failed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a config file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileReadFailed`] when the file cannot be read, plus
    /// anything [`ControllerConfig::from_toml_str`] returns.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)
            .map_err(|e| Error::file_read_failed(path, e.to_string()))?;
        tracing::debug!(path = %path.display(), "Loaded controller config");
        Self::from_toml_str(&input)
    }

    /// Check invariants the controller relies on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::invalid_config("workers must be at least 1"));
        }
        if self.reconcile_timeout_ms == 0 {
            return Err(Error::invalid_config("reconcile_timeout_ms must be positive"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(Error::invalid_config(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        if !self.reference.field_path.starts_with('/') {
            return Err(Error::invalid_config(format!(
                "reference.field_path '{}' is not a JSON pointer",
                self.reference.field_path
            )));
        }
        Ok(())
    }

    /// Deadline for a single reconciliation.
    pub const fn reconcile_timeout(&self) -> Duration {
        Duration::from_millis(self.reconcile_timeout_ms)
    }
}
