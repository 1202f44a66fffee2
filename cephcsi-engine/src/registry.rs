//! Cluster map resolution.
//!
//! The driver learns about Ceph clusters from a JSON file listing, per
//! cluster: the monitor addresses, the RADOS namespace to scope objects to,
//! CephFS defaults and read-affinity labels. Secrets never live in this
//! file; they arrive with each request.
//!
//! Lookups re-read the file, so a cluster added while the daemon runs is
//! visible to the next request. A successful lookup reflects some recently
//! observed state of the file; no cross-lookup consistency is promised.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::error::{EngineError, Result};

/// Default CephFS subvolume group when a cluster does not name one.
pub const DEFAULT_SUBVOLUME_GROUP: &str = "csi";

/// CephFS-specific cluster settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CephFsOptions {
    /// Subvolume group all subvolumes are created in.
    pub subvolume_group: Option<String>,
    /// Extra options for kernel mounts.
    pub kernel_mount_options: Option<String>,
    /// Extra options for FUSE mounts.
    pub fuse_mount_options: Option<String>,
}

/// Read-affinity settings for a cluster.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadAffinity {
    pub enabled: bool,
    pub crush_location_labels: Vec<String>,
}

/// One cluster entry from the cluster map file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    pub monitors: Vec<String>,
    #[serde(default)]
    pub rados_namespace: String,
    #[serde(rename = "cephFS", default)]
    pub ceph_fs: CephFsOptions,
    #[serde(default)]
    pub read_affinity: ReadAffinity,
}

impl ClusterInfo {
    /// Comma-joined monitor list, the form the Ceph CLIs expect.
    pub fn mon_host(&self) -> String {
        self.monitors.join(",")
    }

    /// Subvolume group for CephFS subvolumes, falling back to the default.
    pub fn subvolume_group(&self) -> &str {
        self.ceph_fs
            .subvolume_group
            .as_deref()
            .unwrap_or(DEFAULT_SUBVOLUME_GROUP)
    }
}

/// Resolves opaque cluster ids to cluster connection details.
#[derive(Debug)]
pub struct ClusterRegistry {
    source: Source,
}

#[derive(Debug)]
enum Source {
    File(PathBuf),
    /// Fixed set injected by tests.
    Static(Vec<ClusterInfo>),
}

impl ClusterRegistry {
    /// Registry backed by a JSON cluster map file. The file is parsed on
    /// every lookup; a missing or malformed file fails the lookup, not the
    /// constructor.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Self {
        Self {
            source: Source::File(path.as_ref().to_path_buf()),
        }
    }

    /// Registry over a fixed cluster list, for tests.
    pub fn from_clusters(clusters: Vec<ClusterInfo>) -> Self {
        Self {
            source: Source::Static(clusters),
        }
    }

    fn load(&self) -> Result<Vec<ClusterInfo>> {
        match &self.source {
            Source::Static(clusters) => Ok(clusters.clone()),
            Source::File(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    EngineError::Internal(format!(
                        "failed to read cluster map {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                serde_json::from_str(&content).map_err(|e| {
                    EngineError::Internal(format!(
                        "failed to parse cluster map {}: {}",
                        path.display(),
                        e
                    ))
                })
            }
        }
    }

    /// Whether the configured source currently parses. Used by Probe.
    pub fn healthy(&self) -> bool {
        self.load().is_ok()
    }

    /// Resolve a cluster id to its full entry.
    pub fn lookup(&self, cluster_id: &str) -> Result<ClusterInfo> {
        self.load()?
            .into_iter()
            .find(|c| c.cluster_id == cluster_id)
            .ok_or_else(|| {
                EngineError::NotFound(format!("cluster {cluster_id} not present in cluster map"))
            })
    }

    /// Monitor addresses for a cluster.
    pub fn mons(&self, cluster_id: &str) -> Result<Vec<String>> {
        Ok(self.lookup(cluster_id)?.monitors)
    }

    /// RADOS namespace for a cluster; empty string when unset.
    pub fn rados_namespace(&self, cluster_id: &str) -> Result<String> {
        Ok(self.lookup(cluster_id)?.rados_namespace)
    }

    /// CephFS subvolume group for a cluster, defaulted.
    pub fn subvolume_group(&self, cluster_id: &str) -> Result<String> {
        Ok(self.lookup(cluster_id)?.subvolume_group().to_string())
    }
}

// Process-wide registry with an explicit init/shutdown lifecycle. Tests
// construct private instances instead.
static GLOBAL: Lazy<RwLock<Option<Arc<ClusterRegistry>>>> = Lazy::new(|| RwLock::new(None));

/// Install the process-wide registry.
pub fn init<P: AsRef<Path>>(path: P) -> Arc<ClusterRegistry> {
    let registry = Arc::new(ClusterRegistry::from_file(path));
    *GLOBAL.write().unwrap_or_else(|p| p.into_inner()) = Some(registry.clone());
    registry
}

/// The process-wide registry, if initialized.
pub fn global() -> Option<Arc<ClusterRegistry>> {
    GLOBAL.read().unwrap_or_else(|p| p.into_inner()).clone()
}

/// Drop the process-wide registry.
pub fn shutdown() {
    *GLOBAL.write().unwrap_or_else(|p| p.into_inner()) = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_cluster(id: &str) -> ClusterInfo {
        ClusterInfo {
            cluster_id: id.to_string(),
            monitors: vec!["10.0.0.1:6789".to_string(), "10.0.0.2:6789".to_string()],
            rados_namespace: String::new(),
            ceph_fs: CephFsOptions::default(),
            read_affinity: ReadAffinity::default(),
        }
    }

    #[test]
    fn test_static_lookup() {
        let registry = ClusterRegistry::from_clusters(vec![sample_cluster("c1")]);
        assert_eq!(registry.mons("c1").unwrap().len(), 2);
        assert!(matches!(
            registry.lookup("c2"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_subvolume_group_default() {
        let registry = ClusterRegistry::from_clusters(vec![sample_cluster("c1")]);
        assert_eq!(registry.subvolume_group("c1").unwrap(), "csi");
    }

    #[test]
    fn test_file_lookup_and_rereads() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"clusterID": "c1", "monitors": ["10.0.0.1:6789"]}}]"#
        )
        .unwrap();
        file.flush().unwrap();

        let registry = ClusterRegistry::from_file(file.path());
        assert_eq!(registry.mons("c1").unwrap(), vec!["10.0.0.1:6789"]);
        assert!(registry.lookup("c2").is_err());

        // A cluster added after construction is visible to the next lookup.
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(file.path())
            .unwrap();
        write!(
            file,
            r#"[{{"clusterID": "c1", "monitors": ["10.0.0.1:6789"]}},
                {{"clusterID": "c2", "monitors": ["10.1.0.1:6789"],
                  "radosNamespace": "tenant-a",
                  "cephFS": {{"subvolumeGroup": "group-a"}}}}]"#
        )
        .unwrap();
        file.flush().unwrap();

        assert_eq!(registry.rados_namespace("c2").unwrap(), "tenant-a");
        assert_eq!(registry.subvolume_group("c2").unwrap(), "group-a");
    }

    #[test]
    fn test_missing_file_fails_lookup_not_construction() {
        let registry = ClusterRegistry::from_file("/nonexistent/cluster-map.json");
        assert!(!registry.healthy());
        assert!(registry.lookup("c1").is_err());
    }
}
