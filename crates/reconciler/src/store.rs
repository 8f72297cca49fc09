//! Read and write interfaces to the resource API, plus an in-memory cluster.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use confcascade_core::{
    ConfigurationResource, Dependent, LabelSelector, ObjectKey, ReconcileKey,
};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::resolver::extract_reference;

/// Kind name used in not-found errors for configuration resources.
pub const CONFIGURATION_KIND: &str = "ConfigurationResource";
/// Kind name used in not-found errors for dependents.
pub const DEPENDENT_KIND: &str = "Dependent";

/// Read side of the resource API.
#[async_trait]
pub trait ResourceReader: Send + Sync {
    /// Fetch a configuration resource. Absent objects yield [`Error::NotFound`].
    async fn get_configuration(&self, key: &ReconcileKey) -> Result<ConfigurationResource>;

    /// List dependents in a namespace that match `selector`.
    async fn list_dependents(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Dependent>>;
}

/// Write side of the resource API.
#[async_trait]
pub trait ResourceWriter: Send + Sync {
    /// Submit a merge patch with no field changes against a dependent.
    async fn patch_empty(&self, dependent: &Dependent) -> Result<()>;
}

/// In-memory cluster used by tests and the snapshot runner.
///
/// With reference defaulting enabled, every empty patch re-stamps the
/// dependent's recorded version from the configuration resource it names,
/// the way an admission plugin would.
#[derive(Default)]
pub struct InMemoryCluster {
    configurations: RwLock<BTreeMap<ObjectKey, ConfigurationResource>>,
    dependents: RwLock<BTreeMap<ObjectKey, Dependent>>,
    patches: RwLock<Vec<ObjectKey>>,
    failing_patches: RwLock<HashSet<ObjectKey>>,
    failing_gets: AtomicUsize,
    failing_lists: AtomicUsize,
    revision: AtomicU64,
    defaulting_path: Option<String>,
}

impl InMemoryCluster {
    /// Create an empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Emulate the admission plugin that stamps references at `field_path`.
    #[must_use]
    pub fn with_reference_defaulting(mut self, field_path: impl Into<String>) -> Self {
        self.defaulting_path = Some(field_path.into());
        self
    }

    /// Store a configuration resource exactly as given.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource has no name.
    pub async fn insert_configuration(&self, resource: ConfigurationResource) -> Result<()> {
        let key = resource.key()?;
        self.configurations.write().await.insert(key, resource);
        Ok(())
    }

    /// Store a configuration resource under a freshly assigned version.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource has no name.
    pub async fn upsert_configuration(
        &self,
        mut resource: ConfigurationResource,
    ) -> Result<ConfigurationResource> {
        let key = resource.key()?;
        let revision = self
            .revision
            .fetch_add(1, Ordering::SeqCst)
            .wrapping_add(1);
        resource.metadata.resource_version = revision.to_string();
        self.configurations
            .write()
            .await
            .insert(key, resource.clone());
        Ok(resource)
    }

    /// Remove a configuration resource.
    pub async fn delete_configuration(&self, key: &ReconcileKey) -> Option<ConfigurationResource> {
        self.configurations.write().await.remove(key)
    }

    /// Look up a configuration resource.
    pub async fn configuration(&self, key: &ReconcileKey) -> Option<ConfigurationResource> {
        self.configurations.read().await.get(key).cloned()
    }

    /// Store a dependent.
    ///
    /// # Errors
    ///
    /// Returns an error if the dependent has no name.
    pub async fn insert_dependent(&self, dependent: Dependent) -> Result<()> {
        let key = dependent.key()?;
        self.dependents.write().await.insert(key, dependent);
        Ok(())
    }

    /// Remove a dependent.
    pub async fn delete_dependent(&self, key: &ObjectKey) -> Option<Dependent> {
        self.dependents.write().await.remove(key)
    }

    /// Look up a dependent.
    pub async fn dependent(&self, key: &ObjectKey) -> Option<Dependent> {
        self.dependents.read().await.get(key).cloned()
    }

    /// Every empty patch accepted so far, in order.
    pub async fn patches(&self) -> Vec<ObjectKey> {
        self.patches.read().await.clone()
    }

    /// Forget the patch log.
    pub async fn clear_patches(&self) {
        self.patches.write().await.clear();
    }

    /// Make patches against `key` fail until [`InMemoryCluster::heal_patches_for`].
    pub async fn fail_patches_for(&self, key: ObjectKey) {
        self.failing_patches.write().await.insert(key);
    }

    /// Let patches against `key` succeed again.
    pub async fn heal_patches_for(&self, key: &ObjectKey) {
        self.failing_patches.write().await.remove(key);
    }

    /// Make the next `count` configuration fetches fail.
    pub fn fail_next_gets(&self, count: usize) {
        self.failing_gets.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` dependent listings fail.
    pub fn fail_next_lists(&self, count: usize) {
        self.failing_lists.store(count, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn stamp_reference(&self, key: &ObjectKey, field_path: &str) {
        let Some(dependent) = self.dependent(key).await else {
            return;
        };
        let Ok(Some(reference)) = extract_reference(&dependent, field_path) else {
            return;
        };
        let config_key = ObjectKey::new(key.namespace.clone(), reference.configuration_name);
        let Some(version) = self
            .configuration(&config_key)
            .await
            .map(|c| c.metadata.resource_version)
        else {
            return;
        };

        let mut dependents = self.dependents.write().await;
        if let Some(Value::Object(fields)) = dependents
            .get_mut(key)
            .and_then(|d| d.spec.pointer_mut(field_path))
        {
            debug!(dependent = %key, version = %version, "Stamped recorded version");
            fields.insert("resourceVersion".to_string(), Value::String(version));
        }
    }
}

#[async_trait]
impl ResourceReader for InMemoryCluster {
    async fn get_configuration(&self, key: &ReconcileKey) -> Result<ConfigurationResource> {
        if Self::take_failure(&self.failing_gets) {
            return Err(Error::api(format!("get {key}"), "injected read failure"));
        }
        self.configuration(key)
            .await
            .ok_or_else(|| Error::not_found(CONFIGURATION_KIND, key.to_string()))
    }

    async fn list_dependents(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Dependent>> {
        if Self::take_failure(&self.failing_lists) {
            return Err(Error::api(
                format!("list dependents in {namespace}"),
                "injected read failure",
            ));
        }
        Ok(self
            .dependents
            .read()
            .await
            .values()
            .filter(|d| d.metadata.namespace == namespace)
            .filter(|d| selector.matches(&d.metadata.labels))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ResourceWriter for InMemoryCluster {
    async fn patch_empty(&self, dependent: &Dependent) -> Result<()> {
        let key = dependent.key()?;
        if self.failing_patches.read().await.contains(&key) {
            return Err(Error::api(format!("patch {key}"), "injected write failure"));
        }
        if !self.dependents.read().await.contains_key(&key) {
            return Err(Error::not_found(DEPENDENT_KIND, key.to_string()));
        }
        self.patches.write().await.push(key.clone());

        if let Some(field_path) = &self.defaulting_path {
            self.stamp_reference(&key, field_path).await;
        }
        Ok(())
    }
}
