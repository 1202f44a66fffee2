//! Ceph backend dispatch.
//!
//! The lifecycle managers never talk to Ceph directly; they dispatch
//! through these traits. The RBD image path and the CephFS subvolume path
//! each get a trait with a CLI-backed production implementation and an
//! in-memory mock used by tests and development mode.

mod cephfs;
mod mock;
mod rbd;

pub use cephfs::CephFsCliBackend;
pub use mock::MockBackend;
pub use rbd::RbdCliBackend;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::credentials::Credentials;
use crate::error::Result;
use crate::registry::ClusterInfo;

/// Connection details handed to every backend call.
///
/// Assembled per request from the resolved cluster entry and the request
/// credentials; the keyring path is only valid while those credentials
/// live.
#[derive(Debug, Clone)]
pub struct CephConn {
    pub mon_host: String,
    pub user: String,
    pub keyring: PathBuf,
}

impl CephConn {
    pub fn new(cluster: &ClusterInfo, creds: &Credentials) -> Result<Self> {
        Ok(Self {
            mon_host: cluster.mon_host(),
            user: creds.user().to_string(),
            keyring: creds.keyfile_path()?.to_path_buf(),
        })
    }
}

/// Observed state of an RBD image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageStatus {
    pub size_bytes: u64,
    pub features: Vec<String>,
}

/// Observed state of a CephFS subvolume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubvolumeStatus {
    pub size_bytes: u64,
}

/// Mirroring role of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorState {
    Disabled,
    Primary,
    Secondary,
}

/// Mirroring status of an image.
#[derive(Debug, Clone)]
pub struct MirrorStatus {
    pub state: MirrorState,
    pub description: String,
    pub last_sync: Option<DateTime<Utc>>,
    /// Whether a resync has caught the image up.
    pub up_to_date: bool,
}

/// RBD image operations.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    async fn create_image(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
        size_bytes: u64,
        features: &[String],
    ) -> Result<()>;

    /// `None` when the image does not exist.
    async fn image_status(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ImageStatus>>;

    /// Delete an image and its snapshots; deleting a missing image
    /// succeeds.
    async fn delete_image(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
    ) -> Result<()>;

    /// Grow an image. Shrinking is refused by the manager before dispatch.
    async fn resize_image(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
        new_size_bytes: u64,
    ) -> Result<()>;

    async fn create_snapshot(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        image: &str,
        snapshot: &str,
    ) -> Result<()>;

    /// Deleting a missing snapshot succeeds.
    async fn delete_snapshot(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        image: &str,
        snapshot: &str,
    ) -> Result<()>;

    async fn snapshot_exists(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        image: &str,
        snapshot: &str,
    ) -> Result<bool>;

    /// Copy-on-write clone of `source_image@source_snapshot`.
    async fn clone_image(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        source_image: &str,
        source_snapshot: &str,
        dest_name: &str,
        features: &[String],
    ) -> Result<()>;

    /// Detach an image from its parent chain.
    async fn flatten_image(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
    ) -> Result<()>;

    /// Map an image into the node's device tree; returns the device path.
    async fn map_image(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
        map_options: Option<&str>,
    ) -> Result<String>;

    async fn unmap_image(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
    ) -> Result<()>;

    async fn mirror_enable(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
        mode: &str,
    ) -> Result<()>;

    async fn mirror_disable(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
        force: bool,
    ) -> Result<()>;

    async fn mirror_promote(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
        force: bool,
    ) -> Result<()>;

    async fn mirror_demote(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
    ) -> Result<()>;

    async fn mirror_resync(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
    ) -> Result<()>;

    async fn mirror_status(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
    ) -> Result<MirrorStatus>;
}

/// CephFS subvolume operations.
#[async_trait]
pub trait FsBackend: Send + Sync {
    async fn create_subvolume(
        &self,
        conn: &CephConn,
        fs_name: &str,
        group: &str,
        name: &str,
        size_bytes: u64,
    ) -> Result<()>;

    /// `None` when the subvolume does not exist.
    async fn subvolume_status(
        &self,
        conn: &CephConn,
        fs_name: &str,
        group: &str,
        name: &str,
    ) -> Result<Option<SubvolumeStatus>>;

    /// Deleting a missing subvolume succeeds.
    async fn delete_subvolume(
        &self,
        conn: &CephConn,
        fs_name: &str,
        group: &str,
        name: &str,
    ) -> Result<()>;

    async fn resize_subvolume(
        &self,
        conn: &CephConn,
        fs_name: &str,
        group: &str,
        name: &str,
        new_size_bytes: u64,
    ) -> Result<()>;

    /// Mount path of the subvolume inside the filesystem.
    async fn subvolume_path(
        &self,
        conn: &CephConn,
        fs_name: &str,
        group: &str,
        name: &str,
    ) -> Result<String>;

    async fn create_subvolume_snapshot(
        &self,
        conn: &CephConn,
        fs_name: &str,
        group: &str,
        subvolume: &str,
        snapshot: &str,
    ) -> Result<()>;

    /// Deleting a missing snapshot succeeds.
    async fn delete_subvolume_snapshot(
        &self,
        conn: &CephConn,
        fs_name: &str,
        group: &str,
        subvolume: &str,
        snapshot: &str,
    ) -> Result<()>;

    async fn subvolume_snapshot_exists(
        &self,
        conn: &CephConn,
        fs_name: &str,
        group: &str,
        subvolume: &str,
        snapshot: &str,
    ) -> Result<bool>;

    /// Clone a snapshot into a new subvolume and wait for the clone to
    /// complete.
    async fn clone_subvolume_snapshot(
        &self,
        conn: &CephConn,
        fs_name: &str,
        group: &str,
        source_subvolume: &str,
        snapshot: &str,
        dest_name: &str,
    ) -> Result<()>;
}
