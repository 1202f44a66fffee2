//! Request parameter parsing.
//!
//! The orchestrator passes a free-form string map with every provisioning
//! request. Well-known keys are picked out here; unknown keys are ignored
//! for forward compatibility.

use std::collections::HashMap;

use crate::error::{EngineError, Result};
use crate::mount::MounterType;
use crate::registry::{ClusterInfo, ClusterRegistry};

pub const PARAM_CLUSTER_ID: &str = "clusterID";
pub const PARAM_POOL: &str = "pool";
pub const PARAM_FS_NAME: &str = "fsName";
pub const PARAM_MOUNTER: &str = "mounter";
pub const PARAM_STATIC_VOLUME: &str = "staticVolume";
pub const PARAM_MAP_OPTIONS: &str = "mapOptions";
pub const PARAM_KERNEL_MOUNT_OPTIONS: &str = "kernelMountOptions";
pub const PARAM_FUSE_MOUNT_OPTIONS: &str = "fuseMountOptions";
pub const PARAM_IMAGE_FEATURES: &str = "imageFeatures";
pub const PARAM_ENCRYPTED: &str = "encrypted";
pub const PARAM_ENCRYPTION_KMS_ID: &str = "encryptionKMSID";
pub const PARAM_NAME_PREFIX: &str = "namePrefix";
pub const PARAM_VOLUME_NAME_PREFIX: &str = "volumeNamePrefix";
pub const PARAM_SNAPSHOT_NAME_PREFIX: &str = "snapshotNamePrefix";

/// Which storage path a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Rbd,
    CephFs,
}

/// Parsed and resolved per-request volume options.
#[derive(Debug, Clone)]
pub struct VolumeOptions {
    pub cluster: ClusterInfo,
    pub kind: BackendKind,
    /// Backend pool for RBD; journal (metadata) pool for CephFS.
    pub pool: String,
    pub fs_name: Option<String>,
    pub mounter: MounterType,
    pub static_volume: bool,
    pub image_features: Vec<String>,
    pub encrypted: bool,
    pub kms_id: Option<String>,
    pub name_prefix: Option<String>,
    pub map_options: Option<String>,
    pub kernel_mount_options: Option<String>,
    pub fuse_mount_options: Option<String>,
}

impl VolumeOptions {
    /// Parse the parameter map against a registry.
    pub fn from_params(
        registry: &ClusterRegistry,
        params: &HashMap<String, String>,
        kind: BackendKind,
    ) -> Result<Self> {
        let cluster_id = params
            .get(PARAM_CLUSTER_ID)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                EngineError::InvalidArgument(format!("{PARAM_CLUSTER_ID} parameter is required"))
            })?;
        let cluster = registry.lookup(cluster_id)?;

        let fs_name = params.get(PARAM_FS_NAME).cloned();
        let pool = match kind {
            BackendKind::Rbd => params
                .get(PARAM_POOL)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| {
                    EngineError::InvalidArgument(format!("{PARAM_POOL} parameter is required"))
                })?,
            BackendKind::CephFs => {
                let fs = fs_name.as_deref().filter(|v| !v.is_empty()).ok_or_else(|| {
                    EngineError::InvalidArgument(format!("{PARAM_FS_NAME} parameter is required"))
                })?;
                // Journal objects live in the filesystem's metadata pool
                // unless a pool is named explicitly.
                params
                    .get(PARAM_POOL)
                    .filter(|v| !v.is_empty())
                    .cloned()
                    .unwrap_or_else(|| format!("cephfs.{fs}.meta"))
            }
        };

        let mounter = match params.get(PARAM_MOUNTER) {
            Some(value) => MounterType::parse(value)?,
            None => MounterType::default(),
        };

        Ok(Self {
            cluster,
            kind,
            pool,
            fs_name,
            mounter,
            static_volume: params
                .get(PARAM_STATIC_VOLUME)
                .map(|v| v == "true")
                .unwrap_or(false),
            image_features: params
                .get(PARAM_IMAGE_FEATURES)
                .map(|v| {
                    v.split(',')
                        .map(|f| f.trim().to_string())
                        .filter(|f| !f.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            encrypted: params
                .get(PARAM_ENCRYPTED)
                .map(|v| v == "true")
                .unwrap_or(false),
            kms_id: params.get(PARAM_ENCRYPTION_KMS_ID).cloned(),
            name_prefix: params
                .get(PARAM_NAME_PREFIX)
                .or_else(|| params.get(PARAM_VOLUME_NAME_PREFIX))
                .cloned(),
            map_options: params.get(PARAM_MAP_OPTIONS).cloned(),
            kernel_mount_options: params.get(PARAM_KERNEL_MOUNT_OPTIONS).cloned(),
            fuse_mount_options: params.get(PARAM_FUSE_MOUNT_OPTIONS).cloned(),
        })
    }

    /// RADOS namespace scoping every object of this request.
    pub fn rados_namespace(&self) -> &str {
        &self.cluster.rados_namespace
    }

    /// CephFS subvolume group, defaulted from the cluster entry.
    pub fn subvolume_group(&self) -> &str {
        self.cluster.subvolume_group()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CephFsOptions, ReadAffinity};

    fn registry() -> ClusterRegistry {
        ClusterRegistry::from_clusters(vec![ClusterInfo {
            cluster_id: "c1".to_string(),
            monitors: vec!["10.0.0.1:6789".to_string()],
            rados_namespace: "tenant-a".to_string(),
            ceph_fs: CephFsOptions::default(),
            read_affinity: ReadAffinity::default(),
        }])
    }

    fn params(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_rbd_params() {
        let opts = VolumeOptions::from_params(
            &registry(),
            &params(&[
                ("clusterID", "c1"),
                ("pool", "rbd"),
                ("imageFeatures", "layering,exclusive-lock"),
                ("encrypted", "true"),
                ("encryptionKMSID", "vault-1"),
            ]),
            BackendKind::Rbd,
        )
        .unwrap();
        assert_eq!(opts.pool, "rbd");
        assert_eq!(opts.rados_namespace(), "tenant-a");
        assert_eq!(opts.image_features, vec!["layering", "exclusive-lock"]);
        assert!(opts.encrypted);
        assert_eq!(opts.kms_id.as_deref(), Some("vault-1"));
    }

    #[test]
    fn test_missing_cluster_id_rejected() {
        let err = VolumeOptions::from_params(
            &registry(),
            &params(&[("pool", "rbd")]),
            BackendKind::Rbd,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn test_missing_pool_rejected_for_rbd() {
        let err = VolumeOptions::from_params(
            &registry(),
            &params(&[("clusterID", "c1")]),
            BackendKind::Rbd,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn test_cephfs_requires_fs_name_and_derives_pool() {
        let err = VolumeOptions::from_params(
            &registry(),
            &params(&[("clusterID", "c1")]),
            BackendKind::CephFs,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));

        let opts = VolumeOptions::from_params(
            &registry(),
            &params(&[("clusterID", "c1"), ("fsName", "cephfs")]),
            BackendKind::CephFs,
        )
        .unwrap();
        assert_eq!(opts.pool, "cephfs.cephfs.meta");
        assert_eq!(opts.fs_name.as_deref(), Some("cephfs"));
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let opts = VolumeOptions::from_params(
            &registry(),
            &params(&[
                ("clusterID", "c1"),
                ("pool", "rbd"),
                ("some/future.key", "value"),
                ("csi.storage.k8s.io/pvc/name", "pvc-1"),
            ]),
            BackendKind::Rbd,
        )
        .unwrap();
        assert_eq!(opts.pool, "rbd");
    }

    #[test]
    fn test_mounter_parsing() {
        let opts = VolumeOptions::from_params(
            &registry(),
            &params(&[("clusterID", "c1"), ("fsName", "cephfs"), ("mounter", "fuse")]),
            BackendKind::CephFs,
        )
        .unwrap();
        assert_eq!(opts.mounter, MounterType::Fuse);

        assert!(VolumeOptions::from_params(
            &registry(),
            &params(&[("clusterID", "c1"), ("fsName", "cephfs"), ("mounter", "bad")]),
            BackendKind::CephFs,
        )
        .is_err());
    }
}
