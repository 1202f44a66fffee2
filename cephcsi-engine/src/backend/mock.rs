//! Mock Ceph backend for testing and development.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, instrument};

use crate::error::{EngineError, Result};

use super::{
    CephConn, FsBackend, ImageBackend, ImageStatus, MirrorState, MirrorStatus, SubvolumeStatus,
};

#[derive(Debug, Clone)]
struct MockImage {
    size_bytes: u64,
    features: Vec<String>,
    snapshots: HashSet<String>,
    parent: Option<String>,
    mirror: MirrorState,
    mapped: bool,
}

#[derive(Debug, Clone)]
struct MockSubvolume {
    size_bytes: u64,
    snapshots: HashSet<String>,
}

/// Mock backend simulating both the RBD and the CephFS paths in memory.
///
/// Useful for:
/// - Unit and integration testing
/// - Development without a Ceph cluster
/// - Demo environments
///
/// Tests can inject per-name snapshot failures to exercise rollback paths.
pub struct MockBackend {
    images: RwLock<HashMap<String, MockImage>>,
    subvolumes: RwLock<HashMap<String, MockSubvolume>>,
    fail_snapshots_of: RwLock<HashSet<String>>,
}

impl MockBackend {
    /// Create a new mock backend.
    pub fn new() -> Self {
        info!("Creating mock Ceph backend");
        Self {
            images: RwLock::new(HashMap::new()),
            subvolumes: RwLock::new(HashMap::new()),
            fail_snapshots_of: RwLock::new(HashSet::new()),
        }
    }

    /// Make every snapshot attempt against `image_or_subvolume` fail.
    pub fn fail_snapshots_of(&self, image_or_subvolume: &str) {
        self.lock_fail().insert(image_or_subvolume.to_string());
    }

    /// Number of live images.
    pub fn image_count(&self) -> usize {
        self.lock_images().len()
    }

    /// Snapshot names of an image, for assertions.
    pub fn image_snapshots(&self, pool: &str, namespace: &str, name: &str) -> Vec<String> {
        self.lock_images()
            .get(&spec(pool, namespace, name))
            .map(|i| i.snapshots.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn lock_images(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, MockImage>> {
        self.images.write().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_subvolumes(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, MockSubvolume>> {
        self.subvolumes.write().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_fail(&self) -> std::sync::RwLockWriteGuard<'_, HashSet<String>> {
        self.fail_snapshots_of
            .write()
            .unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn spec(pool: &str, namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        format!("{pool}/{name}")
    } else {
        format!("{pool}/{namespace}/{name}")
    }
}

fn subvolume_spec(fs_name: &str, group: &str, name: &str) -> String {
    format!("{fs_name}/{group}/{name}")
}

#[async_trait]
impl ImageBackend for MockBackend {
    #[instrument(skip(self, _conn), fields(pool = %pool, name = %name))]
    async fn create_image(
        &self,
        _conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
        size_bytes: u64,
        features: &[String],
    ) -> Result<()> {
        let mut images = self.lock_images();
        let key = spec(pool, namespace, name);
        if images.contains_key(&key) {
            return Err(EngineError::AlreadyExists(format!(
                "image {key} already exists"
            )));
        }
        images.insert(
            key,
            MockImage {
                size_bytes,
                features: features.to_vec(),
                snapshots: HashSet::new(),
                parent: None,
                mirror: MirrorState::Disabled,
                mapped: false,
            },
        );
        info!("Mock image created");
        Ok(())
    }

    async fn image_status(
        &self,
        _conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ImageStatus>> {
        Ok(self
            .lock_images()
            .get(&spec(pool, namespace, name))
            .map(|i| ImageStatus {
                size_bytes: i.size_bytes,
                features: i.features.clone(),
            }))
    }

    async fn delete_image(
        &self,
        _conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        self.lock_images().remove(&spec(pool, namespace, name));
        Ok(())
    }

    async fn resize_image(
        &self,
        _conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
        new_size_bytes: u64,
    ) -> Result<()> {
        let mut images = self.lock_images();
        let image = images
            .get_mut(&spec(pool, namespace, name))
            .ok_or_else(|| EngineError::NotFound(format!("image {name} not found")))?;
        image.size_bytes = new_size_bytes;
        Ok(())
    }

    async fn create_snapshot(
        &self,
        _conn: &CephConn,
        pool: &str,
        namespace: &str,
        image: &str,
        snapshot: &str,
    ) -> Result<()> {
        if self.lock_fail().contains(image) {
            return Err(EngineError::BackendPermanent(format!(
                "injected snapshot failure for {image}"
            )));
        }
        let mut images = self.lock_images();
        let entry = images
            .get_mut(&spec(pool, namespace, image))
            .ok_or_else(|| EngineError::NotFound(format!("image {image} not found")))?;
        entry.snapshots.insert(snapshot.to_string());
        Ok(())
    }

    async fn delete_snapshot(
        &self,
        _conn: &CephConn,
        pool: &str,
        namespace: &str,
        image: &str,
        snapshot: &str,
    ) -> Result<()> {
        if let Some(entry) = self.lock_images().get_mut(&spec(pool, namespace, image)) {
            entry.snapshots.remove(snapshot);
        }
        Ok(())
    }

    async fn snapshot_exists(
        &self,
        _conn: &CephConn,
        pool: &str,
        namespace: &str,
        image: &str,
        snapshot: &str,
    ) -> Result<bool> {
        Ok(self
            .lock_images()
            .get(&spec(pool, namespace, image))
            .map(|i| i.snapshots.contains(snapshot))
            .unwrap_or(false))
    }

    async fn clone_image(
        &self,
        _conn: &CephConn,
        pool: &str,
        namespace: &str,
        source_image: &str,
        source_snapshot: &str,
        dest_name: &str,
        features: &[String],
    ) -> Result<()> {
        let mut images = self.lock_images();
        let source_key = spec(pool, namespace, source_image);
        let source = images
            .get(&source_key)
            .ok_or_else(|| EngineError::NotFound(format!("image {source_image} not found")))?;
        if !source.snapshots.contains(source_snapshot) {
            return Err(EngineError::NotFound(format!(
                "snapshot {source_snapshot} of {source_image} not found"
            )));
        }
        let size_bytes = source.size_bytes;

        let dest_key = spec(pool, namespace, dest_name);
        if images.contains_key(&dest_key) {
            return Err(EngineError::AlreadyExists(format!(
                "image {dest_name} already exists"
            )));
        }
        images.insert(
            dest_key,
            MockImage {
                size_bytes,
                features: features.to_vec(),
                snapshots: HashSet::new(),
                parent: Some(format!("{source_key}@{source_snapshot}")),
                mirror: MirrorState::Disabled,
                mapped: false,
            },
        );
        Ok(())
    }

    async fn flatten_image(
        &self,
        _conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let mut images = self.lock_images();
        let image = images
            .get_mut(&spec(pool, namespace, name))
            .ok_or_else(|| EngineError::NotFound(format!("image {name} not found")))?;
        image.parent = None;
        Ok(())
    }

    async fn map_image(
        &self,
        _conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
        _map_options: Option<&str>,
    ) -> Result<String> {
        let mut images = self.lock_images();
        let image = images
            .get_mut(&spec(pool, namespace, name))
            .ok_or_else(|| EngineError::NotFound(format!("image {name} not found")))?;
        image.mapped = true;
        Ok(format!("/dev/rbd-mock/{pool}/{name}"))
    }

    async fn unmap_image(
        &self,
        _conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        if let Some(image) = self.lock_images().get_mut(&spec(pool, namespace, name)) {
            image.mapped = false;
        }
        Ok(())
    }

    async fn mirror_enable(
        &self,
        _conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
        _mode: &str,
    ) -> Result<()> {
        let mut images = self.lock_images();
        let image = images
            .get_mut(&spec(pool, namespace, name))
            .ok_or_else(|| EngineError::NotFound(format!("image {name} not found")))?;
        image.mirror = MirrorState::Primary;
        Ok(())
    }

    async fn mirror_disable(
        &self,
        _conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
        _force: bool,
    ) -> Result<()> {
        let mut images = self.lock_images();
        let image = images
            .get_mut(&spec(pool, namespace, name))
            .ok_or_else(|| EngineError::NotFound(format!("image {name} not found")))?;
        image.mirror = MirrorState::Disabled;
        Ok(())
    }

    async fn mirror_promote(
        &self,
        _conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
        _force: bool,
    ) -> Result<()> {
        let mut images = self.lock_images();
        let image = images
            .get_mut(&spec(pool, namespace, name))
            .ok_or_else(|| EngineError::NotFound(format!("image {name} not found")))?;
        if image.mirror == MirrorState::Disabled {
            return Err(EngineError::BackendPermanent(format!(
                "mirroring not enabled on {name}"
            )));
        }
        image.mirror = MirrorState::Primary;
        Ok(())
    }

    async fn mirror_demote(
        &self,
        _conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let mut images = self.lock_images();
        let image = images
            .get_mut(&spec(pool, namespace, name))
            .ok_or_else(|| EngineError::NotFound(format!("image {name} not found")))?;
        if image.mirror == MirrorState::Disabled {
            return Err(EngineError::BackendPermanent(format!(
                "mirroring not enabled on {name}"
            )));
        }
        image.mirror = MirrorState::Secondary;
        Ok(())
    }

    async fn mirror_resync(
        &self,
        _conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let images = self.lock_images();
        let image = images
            .get(&spec(pool, namespace, name))
            .ok_or_else(|| EngineError::NotFound(format!("image {name} not found")))?;
        if image.mirror != MirrorState::Secondary {
            return Err(EngineError::BackendPermanent(format!(
                "resync requires a demoted image, {name} is not one"
            )));
        }
        Ok(())
    }

    async fn mirror_status(
        &self,
        _conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
    ) -> Result<MirrorStatus> {
        let images = self.lock_images();
        let image = images
            .get(&spec(pool, namespace, name))
            .ok_or_else(|| EngineError::NotFound(format!("image {name} not found")))?;
        Ok(MirrorStatus {
            state: image.mirror,
            description: "mock".to_string(),
            last_sync: Some(Utc::now()),
            up_to_date: true,
        })
    }
}

#[async_trait]
impl FsBackend for MockBackend {
    #[instrument(skip(self, _conn), fields(fs = %fs_name, name = %name))]
    async fn create_subvolume(
        &self,
        _conn: &CephConn,
        fs_name: &str,
        group: &str,
        name: &str,
        size_bytes: u64,
    ) -> Result<()> {
        let mut subvolumes = self.lock_subvolumes();
        let key = subvolume_spec(fs_name, group, name);
        if subvolumes.contains_key(&key) {
            return Err(EngineError::AlreadyExists(format!(
                "subvolume {key} already exists"
            )));
        }
        subvolumes.insert(
            key,
            MockSubvolume {
                size_bytes,
                snapshots: HashSet::new(),
            },
        );
        info!("Mock subvolume created");
        Ok(())
    }

    async fn subvolume_status(
        &self,
        _conn: &CephConn,
        fs_name: &str,
        group: &str,
        name: &str,
    ) -> Result<Option<SubvolumeStatus>> {
        Ok(self
            .lock_subvolumes()
            .get(&subvolume_spec(fs_name, group, name))
            .map(|s| SubvolumeStatus {
                size_bytes: s.size_bytes,
            }))
    }

    async fn delete_subvolume(
        &self,
        _conn: &CephConn,
        fs_name: &str,
        group: &str,
        name: &str,
    ) -> Result<()> {
        self.lock_subvolumes()
            .remove(&subvolume_spec(fs_name, group, name));
        Ok(())
    }

    async fn resize_subvolume(
        &self,
        _conn: &CephConn,
        fs_name: &str,
        group: &str,
        name: &str,
        new_size_bytes: u64,
    ) -> Result<()> {
        let mut subvolumes = self.lock_subvolumes();
        let subvolume = subvolumes
            .get_mut(&subvolume_spec(fs_name, group, name))
            .ok_or_else(|| EngineError::NotFound(format!("subvolume {name} not found")))?;
        subvolume.size_bytes = new_size_bytes;
        Ok(())
    }

    async fn subvolume_path(
        &self,
        _conn: &CephConn,
        fs_name: &str,
        group: &str,
        name: &str,
    ) -> Result<String> {
        let subvolumes = self.lock_subvolumes();
        if !subvolumes.contains_key(&subvolume_spec(fs_name, group, name)) {
            return Err(EngineError::NotFound(format!("subvolume {name} not found")));
        }
        Ok(format!("/volumes/{group}/{name}"))
    }

    async fn create_subvolume_snapshot(
        &self,
        _conn: &CephConn,
        fs_name: &str,
        group: &str,
        subvolume: &str,
        snapshot: &str,
    ) -> Result<()> {
        if self.lock_fail().contains(subvolume) {
            return Err(EngineError::BackendPermanent(format!(
                "injected snapshot failure for {subvolume}"
            )));
        }
        let mut subvolumes = self.lock_subvolumes();
        let entry = subvolumes
            .get_mut(&subvolume_spec(fs_name, group, subvolume))
            .ok_or_else(|| EngineError::NotFound(format!("subvolume {subvolume} not found")))?;
        entry.snapshots.insert(snapshot.to_string());
        Ok(())
    }

    async fn delete_subvolume_snapshot(
        &self,
        _conn: &CephConn,
        fs_name: &str,
        group: &str,
        subvolume: &str,
        snapshot: &str,
    ) -> Result<()> {
        if let Some(entry) = self
            .lock_subvolumes()
            .get_mut(&subvolume_spec(fs_name, group, subvolume))
        {
            entry.snapshots.remove(snapshot);
        }
        Ok(())
    }

    async fn subvolume_snapshot_exists(
        &self,
        _conn: &CephConn,
        fs_name: &str,
        group: &str,
        subvolume: &str,
        snapshot: &str,
    ) -> Result<bool> {
        Ok(self
            .lock_subvolumes()
            .get(&subvolume_spec(fs_name, group, subvolume))
            .map(|s| s.snapshots.contains(snapshot))
            .unwrap_or(false))
    }

    async fn clone_subvolume_snapshot(
        &self,
        _conn: &CephConn,
        fs_name: &str,
        group: &str,
        source_subvolume: &str,
        snapshot: &str,
        dest_name: &str,
    ) -> Result<()> {
        let mut subvolumes = self.lock_subvolumes();
        let source = subvolumes
            .get(&subvolume_spec(fs_name, group, source_subvolume))
            .ok_or_else(|| {
                EngineError::NotFound(format!("subvolume {source_subvolume} not found"))
            })?;
        if !source.snapshots.contains(snapshot) {
            return Err(EngineError::NotFound(format!(
                "snapshot {snapshot} of {source_subvolume} not found"
            )));
        }
        let size_bytes = source.size_bytes;

        let dest_key = subvolume_spec(fs_name, group, dest_name);
        if subvolumes.contains_key(&dest_key) {
            return Err(EngineError::AlreadyExists(format!(
                "subvolume {dest_name} already exists"
            )));
        }
        subvolumes.insert(
            dest_key,
            MockSubvolume {
                size_bytes,
                snapshots: HashSet::new(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> CephConn {
        CephConn {
            mon_host: "10.0.0.1:6789".to_string(),
            user: "mock".to_string(),
            keyring: "/tmp/mock-keyring".into(),
        }
    }

    #[tokio::test]
    async fn test_image_lifecycle() {
        let backend = MockBackend::new();
        let conn = conn();

        backend
            .create_image(&conn, "rbd", "", "vol-1", 1 << 30, &[])
            .await
            .unwrap();
        let status = backend
            .image_status(&conn, "rbd", "", "vol-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.size_bytes, 1 << 30);

        backend
            .resize_image(&conn, "rbd", "", "vol-1", 2 << 30)
            .await
            .unwrap();
        backend
            .create_snapshot(&conn, "rbd", "", "vol-1", "snap-1")
            .await
            .unwrap();
        backend
            .clone_image(&conn, "rbd", "", "vol-1", "snap-1", "vol-2", &[])
            .await
            .unwrap();
        let clone = backend
            .image_status(&conn, "rbd", "", "vol-2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(clone.size_bytes, 2 << 30);

        backend.delete_image(&conn, "rbd", "", "vol-2").await.unwrap();
        backend.delete_image(&conn, "rbd", "", "vol-1").await.unwrap();
        // Idempotent: already gone.
        backend.delete_image(&conn, "rbd", "", "vol-1").await.unwrap();
        assert_eq!(backend.image_count(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_failure_injection() {
        let backend = MockBackend::new();
        let conn = conn();

        backend
            .create_image(&conn, "rbd", "", "vol-1", 1 << 30, &[])
            .await
            .unwrap();
        backend.fail_snapshots_of("vol-1");
        assert!(backend
            .create_snapshot(&conn, "rbd", "", "vol-1", "snap-1")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_mirror_state_machine() {
        let backend = MockBackend::new();
        let conn = conn();

        backend
            .create_image(&conn, "rbd", "", "vol-1", 1 << 30, &[])
            .await
            .unwrap();

        assert!(backend
            .mirror_promote(&conn, "rbd", "", "vol-1", false)
            .await
            .is_err());

        backend
            .mirror_enable(&conn, "rbd", "", "vol-1", "snapshot")
            .await
            .unwrap();
        backend
            .mirror_demote(&conn, "rbd", "", "vol-1")
            .await
            .unwrap();
        backend
            .mirror_resync(&conn, "rbd", "", "vol-1")
            .await
            .unwrap();
        backend
            .mirror_promote(&conn, "rbd", "", "vol-1", true)
            .await
            .unwrap();
        let status = backend
            .mirror_status(&conn, "rbd", "", "vol-1")
            .await
            .unwrap();
        assert_eq!(status.state, MirrorState::Primary);
    }

    #[tokio::test]
    async fn test_subvolume_lifecycle() {
        let backend = MockBackend::new();
        let conn = conn();

        backend
            .create_subvolume(&conn, "cephfs", "csi", "sv-1", 1 << 30)
            .await
            .unwrap();
        assert!(backend
            .subvolume_status(&conn, "cephfs", "csi", "sv-1")
            .await
            .unwrap()
            .is_some());
        backend
            .create_subvolume_snapshot(&conn, "cephfs", "csi", "sv-1", "snap-1")
            .await
            .unwrap();
        backend
            .clone_subvolume_snapshot(&conn, "cephfs", "csi", "sv-1", "snap-1", "sv-2")
            .await
            .unwrap();
        assert_eq!(
            backend
                .subvolume_path(&conn, "cephfs", "csi", "sv-2")
                .await
                .unwrap(),
            "/volumes/csi/sv-2"
        );
    }
}
