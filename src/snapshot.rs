//! Cluster snapshots loaded from disk.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use confcascade_core::{ConfigurationResource, Dependent};
use confcascade_reconciler::InMemoryCluster;
use serde::{Deserialize, Serialize};

/// Every configuration resource and dependent in a cluster at one point in time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub configurations: Vec<ConfigurationResource>,
    #[serde(default)]
    pub dependents: Vec<Dependent>,
}

impl Snapshot {
    /// Load a snapshot, choosing YAML or JSON by file extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read snapshot {}", path.display()))?;

        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| matches!(ext, "yaml" | "yml"));

        if is_yaml {
            serde_yaml::from_str(&raw)
                .with_context(|| format!("Invalid YAML snapshot {}", path.display()))
        } else {
            serde_json::from_str(&raw)
                .with_context(|| format!("Invalid JSON snapshot {}", path.display()))
        }
    }

    /// Load the snapshot into an in-memory cluster that stamps references at `field_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if any object has no name.
    pub async fn into_cluster(self, field_path: &str) -> Result<Arc<InMemoryCluster>> {
        let cluster = Arc::new(InMemoryCluster::new().with_reference_defaulting(field_path));
        for configuration in self.configurations {
            cluster.insert_configuration(configuration).await?;
        }
        for dependent in self.dependents {
            cluster.insert_dependent(dependent).await?;
        }
        Ok(cluster)
    }
}
