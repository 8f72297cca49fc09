//! Resource model shared by the reconciler and the process around it.
//!
//! Both resource kinds are owned by an external actor. This crate only
//! describes their shape; nothing here mutates a live object.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Object metadata common to every resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Namespace; empty for cluster-scoped objects.
    #[serde(default)]
    pub namespace: String,
    /// Object name.
    #[serde(default)]
    pub name: String,
    /// Opaque version marker. Only ever compared for equality.
    #[serde(default)]
    pub resource_version: String,
    /// Object labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Create metadata for a namespaced object with no version yet.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the resource version.
    #[must_use]
    pub fn with_resource_version(mut self, version: impl Into<String>) -> Self {
        self.resource_version = version.into();
        self
    }

    /// Add a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Identity of an object: `(namespace, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

/// The unit of work in the queue: the key of a changed configuration resource.
pub type ReconcileKey = ObjectKey;

impl ObjectKey {
    /// Create a key from its parts.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Derive the key of an object from its metadata.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] when the object has no name.
    pub fn for_object(meta: &ObjectMeta) -> Result<Self> {
        if meta.name.is_empty() {
            return Err(Error::invalid_key(
                format!("{}/", meta.namespace),
                "object has no name",
            ));
        }
        Ok(Self::new(meta.namespace.clone(), meta.name.clone()))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for ObjectKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts = s.split('/').collect_vec();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::new("", *name)),
            [namespace, name] if !namespace.is_empty() && !name.is_empty() => {
                Ok(Self::new(*namespace, *name))
            }
            [_] | [_, _] => Err(Error::invalid_key(s, "empty namespace or name")),
            _ => Err(Error::invalid_key(s, "expected 'namespace/name' or 'name'")),
        }
    }
}

/// Shared configuration resource whose content changes are propagated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationResource {
    pub metadata: ObjectMeta,
    /// Content blob. `None` and an empty map carry the same content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<BTreeMap<String, String>>,
}

static NO_DATA: BTreeMap<String, String> = BTreeMap::new();

impl ConfigurationResource {
    /// Create an empty configuration resource.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            data: None,
        }
    }

    /// Set one content entry.
    #[must_use]
    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Set the resource version.
    #[must_use]
    pub fn with_resource_version(mut self, version: impl Into<String>) -> Self {
        self.metadata.resource_version = version.into();
        self
    }

    /// Content blob, with an absent map read as empty.
    pub fn content(&self) -> &BTreeMap<String, String> {
        self.data.as_ref().unwrap_or(&NO_DATA)
    }

    /// Current version marker.
    pub fn version(&self) -> &str {
        &self.metadata.resource_version
    }

    /// Key of this resource.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] when the resource has no name.
    pub fn key(&self) -> Result<ReconcileKey> {
        ObjectKey::for_object(&self.metadata)
    }
}

/// A resource that may reference a configuration resource by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dependent {
    pub metadata: ObjectMeta,
    /// Free-form spec; the reference sits at a configured field path inside it.
    #[serde(default)]
    pub spec: Value,
}

impl Dependent {
    /// Create a dependent with the given spec.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: Value) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
        }
    }

    /// Key of this dependent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] when the dependent has no name.
    pub fn key(&self) -> Result<ObjectKey> {
        ObjectKey::for_object(&self.metadata)
    }
}

/// The `(name, recordedVersion)` pair a dependent holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// Name of the referenced configuration resource (same namespace).
    #[serde(rename = "name")]
    pub configuration_name: String,
    /// Version last stamped by the external defaulting mechanism.
    #[serde(
        rename = "resourceVersion",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub recorded_version: Option<String>,
}

impl Reference {
    /// Create a reference.
    pub fn new(configuration_name: impl Into<String>, recorded_version: Option<String>) -> Self {
        Self {
            configuration_name: configuration_name.into(),
            recorded_version,
        }
    }
}

/// Equality-based label selector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    /// A selector that matches every object.
    pub fn everything() -> Self {
        Self::default()
    }

    /// Require `key=value`.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    /// Whether this selector matches every object.
    pub fn is_everything(&self) -> bool {
        self.match_labels.is_empty()
    }

    /// Check a label set against the selector.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}
