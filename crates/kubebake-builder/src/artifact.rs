//! The build artifact: data volumes kept after a successful build.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use kubebake_cluster::ClusterClient;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{BuildError, BuildResult};

/// Data volumes produced by a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub namespace: String,
    /// Volume names, primary first.
    pub volumes: Vec<String>,
    /// Values generated during the build, such as the instance name.
    #[serde(default)]
    pub generated_data: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    #[must_use]
    pub fn new(namespace: impl Into<String>, volumes: Vec<String>) -> Self {
        Self {
            namespace: namespace.into(),
            volumes,
            generated_data: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Attach a generated value.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.generated_data.insert(key.into(), value.into());
        self
    }

    /// Sorted, comma-separated `namespace:name` list.
    #[must_use]
    pub fn id(&self) -> String {
        let mut ids: Vec<String> = self
            .volumes
            .iter()
            .map(|name| format!("{}:{name}", self.namespace))
            .collect();
        ids.sort();
        ids.join(",")
    }

    /// Delete every volume, continuing past failures.
    ///
    /// A volume that is already gone counts as deleted.
    pub async fn destroy(&self, cluster: &dyn ClusterClient) -> BuildResult<()> {
        let mut failures = Vec::new();
        for name in &self.volumes {
            if let Err(failure) = self.delete_volume(cluster, name).await {
                failures.push(failure);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BuildError::Destroy { failures })
        }
    }

    /// Delete one listed volume.
    pub async fn destroy_volume(&self, cluster: &dyn ClusterClient, name: &str) -> BuildResult<()> {
        if !self.volumes.iter().any(|v| v == name) {
            return Err(BuildError::UnknownVolume {
                namespace: self.namespace.clone(),
                name: name.to_owned(),
            });
        }
        self.delete_volume(cluster, name)
            .await
            .map_err(|failure| BuildError::Destroy {
                failures: vec![failure],
            })
    }

    async fn delete_volume(&self, cluster: &dyn ClusterClient, name: &str) -> Result<(), String> {
        info!(namespace = %self.namespace, name = %name, "deleting data volume");
        match cluster.delete_data_volume(&self.namespace, name).await {
            Ok(()) => {
                info!(name = %name, "data volume deleted");
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                info!(name = %name, "data volume already deleted");
                Ok(())
            }
            Err(err) => {
                warn!(name = %name, error = %err, "failed to delete data volume");
                Err(format!("{}/{name}: {err}", self.namespace))
            }
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.volumes.iter().collect();
        names.sort();

        write!(f, "Data volumes created:")?;
        for name in names {
            write!(f, "\n{}: {name}", self.namespace)?;
        }
        Ok(())
    }
}

/// Artifact plus a schema version, as written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub artifact: Artifact,
    pub schema_version: u32,
}

impl ArtifactManifest {
    pub const SCHEMA_VERSION: u32 = 1;

    #[must_use]
    pub const fn new(artifact: Artifact) -> Self {
        Self {
            artifact,
            schema_version: Self::SCHEMA_VERSION,
        }
    }

    pub fn write_to(&self, path: &Path) -> BuildResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| BuildError::Manifest(format!("failed to serialise manifest: {e}")))?;
        std::fs::write(path, content)?;
        info!(path = %path.display(), "wrote artifact manifest");
        Ok(())
    }

    pub fn read_from(path: &Path) -> BuildResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let manifest: Self = serde_json::from_str(&content)
            .map_err(|e| BuildError::Manifest(format!("failed to parse manifest: {e}")))?;
        if manifest.schema_version != Self::SCHEMA_VERSION {
            return Err(BuildError::Manifest(format!(
                "unsupported schema version {}",
                manifest.schema_version
            )));
        }
        Ok(manifest)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use kubebake_cluster::{DataVolumePhase, MemoryCluster, ResourceKind};

    use super::*;

    fn artifact() -> Artifact {
        Artifact::new("images", vec!["fedora-40".to_owned(), "data".to_owned()])
    }

    #[test]
    fn id_is_sorted() {
        assert_eq!(artifact().id(), "images:data,images:fedora-40");
    }

    #[test]
    fn display_lists_each_volume() {
        assert_eq!(
            artifact().to_string(),
            "Data volumes created:\nimages: data\nimages: fedora-40"
        );
    }

    #[tokio::test]
    async fn destroy_continues_past_failures() {
        let cluster = MemoryCluster::new();
        cluster.insert_data_volume("images", "fedora-40", DataVolumePhase::Succeeded);
        cluster.insert_data_volume("images", "data", DataVolumePhase::Succeeded);
        cluster.fail_delete("fedora-40");

        let err = artifact().destroy(&cluster).await.unwrap_err();

        let BuildError::Destroy { failures } = err else {
            panic!("expected a destroy error");
        };
        assert_eq!(failures.len(), 1);
        assert!(failures[0].starts_with("images/fedora-40"));
        assert_eq!(
            cluster.deleted(ResourceKind::DataVolume),
            vec!["fedora-40", "data"]
        );
        assert_eq!(
            cluster.existing(ResourceKind::DataVolume, "images"),
            vec!["fedora-40"]
        );
    }

    #[tokio::test]
    async fn destroy_tolerates_missing_volumes() {
        let cluster = MemoryCluster::new();
        artifact().destroy(&cluster).await.unwrap();
    }

    #[tokio::test]
    async fn single_volume_is_destroyed_alone() {
        let cluster = MemoryCluster::new();
        cluster.insert_data_volume("images", "fedora-40", DataVolumePhase::Succeeded);
        cluster.insert_data_volume("images", "data", DataVolumePhase::Succeeded);

        artifact().destroy_volume(&cluster, "data").await.unwrap();

        assert_eq!(cluster.deleted(ResourceKind::DataVolume), vec!["data"]);
        assert_eq!(
            cluster.existing(ResourceKind::DataVolume, "images"),
            vec!["fedora-40"]
        );
    }

    #[tokio::test]
    async fn unlisted_volume_is_rejected() {
        let cluster = MemoryCluster::new();
        cluster.insert_data_volume("images", "scratch", DataVolumePhase::Succeeded);

        let err = artifact()
            .destroy_volume(&cluster, "scratch")
            .await
            .unwrap_err();

        assert!(matches!(err, BuildError::UnknownVolume { ref name, .. } if name == "scratch"));
        assert!(cluster.calls().is_empty());
        assert_eq!(
            cluster.existing(ResourceKind::DataVolume, "images"),
            vec!["scratch"]
        );
    }

    #[tokio::test]
    async fn single_volume_already_gone_counts_as_deleted() {
        let cluster = MemoryCluster::new();
        artifact().destroy_volume(&cluster, "fedora-40").await.unwrap();
    }

    #[test]
    fn manifest_survives_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.json");
        let manifest = ArtifactManifest::new(artifact().with_data("instance", "bake-abcde"));

        manifest.write_to(&path).unwrap();
        let read = ArtifactManifest::read_from(&path).unwrap();

        assert_eq!(read, manifest);
    }
}
