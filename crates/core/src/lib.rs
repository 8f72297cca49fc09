//! Core types for confcascade.
//!
//! - **Resources**: configuration resources, dependents and the references between them
//! - **Keys**: `namespace/name` identities used as units of work
//! - **Config**: controller settings loaded from TOML

#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

pub mod config;
pub mod error;
pub mod resource;

pub use config::{ControllerConfig, ReferenceConfig, RetryConfig, DEFAULT_REFERENCE_PATH};
pub use error::{Error, Result};
pub use resource::{
    ConfigurationResource, Dependent, LabelSelector, ObjectKey, ObjectMeta, ReconcileKey,
    Reference,
};
