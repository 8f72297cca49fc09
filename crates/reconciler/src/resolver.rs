//! Dependency resolver: finds the dependents that reference a configuration resource.
//!
//! There is no persisted index. Every pass lists the namespace afresh and
//! projects each dependent's reference out of a fixed field path.

use std::sync::Arc;

use confcascade_core::{
    ConfigurationResource, Dependent, LabelSelector, ReferenceConfig, Reference,
};
use either::Either;
use itertools::Itertools;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::store::ResourceReader;
use crate::types::{ReferencingDependent, Resolution};

/// Read the reference at `field_path` inside a dependent's spec.
///
/// A missing or `null` field means the dependent references nothing.
///
/// # Errors
///
/// Returns [`Error::MalformedReference`] when the field exists but is not a
/// `{ name, resourceVersion }` object.
pub fn extract_reference(dependent: &Dependent, field_path: &str) -> Result<Option<Reference>> {
    match dependent.spec.pointer(field_path) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => parse_reference(value).map(Some).map_err(|reason| {
            Error::malformed_reference(
                dependent
                    .key()
                    .map_or_else(|_| dependent.metadata.name.clone(), |k| k.to_string()),
                reason,
            )
        }),
    }
}

fn parse_reference(value: &Value) -> std::result::Result<Reference, String> {
    serde_json::from_value(value.clone()).map_err(|e| e.to_string())
}

/// Name a reference points at, readable even when the rest of it is not.
fn referenced_name(value: &Value) -> Option<&str> {
    value.get("name").and_then(Value::as_str)
}

/// Lists dependents through an injected reader and picks out the referencing ones.
#[derive(Clone)]
pub struct DependencyResolver {
    reader: Arc<dyn ResourceReader>,
    field_path: String,
    selector: LabelSelector,
}

impl DependencyResolver {
    /// Create a resolver over `reader` using the configured field path and selector.
    pub fn new(reader: Arc<dyn ResourceReader>, config: &ReferenceConfig) -> Self {
        Self {
            reader,
            field_path: config.field_path.clone(),
            selector: config.selector.clone(),
        }
    }

    /// Field path references are read from.
    pub fn field_path(&self) -> &str {
        &self.field_path
    }

    /// List every dependent in `namespace` matching the selector.
    ///
    /// # Errors
    ///
    /// Propagates reader failures.
    pub async fn list_dependents(&self, namespace: &str) -> Result<Vec<Dependent>> {
        self.reader.list_dependents(namespace, &self.selector).await
    }

    /// Split `dependents` into those referencing `config`, unrelated ones, and malformed ones.
    ///
    /// A dependent whose reference names another resource is unrelated even
    /// when the rest of its reference does not parse.
    pub fn select(&self, config: &ConfigurationResource, dependents: Vec<Dependent>) -> Resolution {
        let mut unrelated = 0usize;
        let (referencing, malformed): (Vec<_>, Vec<_>) = dependents
            .into_iter()
            .filter_map(|dependent| {
                let key = match dependent.key() {
                    Ok(key) => key,
                    Err(e) => return Some(Either::Right((dependent.metadata.name, e.to_string()))),
                };
                let value = match dependent.spec.pointer(&self.field_path) {
                    None | Some(Value::Null) => {
                        unrelated = unrelated.saturating_add(1);
                        return None;
                    }
                    Some(value) => value,
                };
                // A readable name for another resource settles it, whatever the rest holds.
                if referenced_name(value).is_some_and(|name| name != config.metadata.name) {
                    unrelated = unrelated.saturating_add(1);
                    return None;
                }
                match parse_reference(value) {
                    Ok(reference) => Some(Either::Left(ReferencingDependent {
                        key,
                        dependent,
                        reference,
                    })),
                    Err(reason) => Some(Either::Right((key.to_string(), reason))),
                }
            })
            .partition_map(|entry| entry);

        Resolution {
            referencing,
            unrelated,
            malformed,
        }
    }

    /// List and select in one call.
    ///
    /// # Errors
    ///
    /// Propagates reader failures.
    pub async fn resolve(&self, config: &ConfigurationResource) -> Result<Resolution> {
        let dependents = self.list_dependents(&config.metadata.namespace).await?;
        Ok(self.select(config, dependents))
    }
}
