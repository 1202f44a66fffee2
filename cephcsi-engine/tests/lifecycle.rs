//! End-to-end lifecycle flows against the in-memory cluster and mock
//! backend.

use std::collections::HashMap;
use std::sync::Arc;

use cephcsi_engine::rados::RadosCluster;
use cephcsi_engine::volumes::options::BackendKind;
use cephcsi_engine::{
    Backends, ConnectionPool, ContentSource, CreateSnapshotParams, CreateVolumeParams,
    EngineContext, EngineError, GroupManager, Journal, MemoryCluster, MockBackend,
    OperationLocks, SnapshotManager, VolumeLocks, VolumeManager,
};
use cephcsi_engine::registry::{CephFsOptions, ClusterInfo, ClusterRegistry, ReadAffinity};

struct Harness {
    ctx: Arc<EngineContext>,
    cluster: Arc<MemoryCluster>,
    backend: Arc<MockBackend>,
}

fn harness(kind: BackendKind) -> Harness {
    let cluster = Arc::new(MemoryCluster::new());
    let backend = Arc::new(MockBackend::new());

    let registry = Arc::new(ClusterRegistry::from_clusters(vec![ClusterInfo {
        cluster_id: "c1".to_string(),
        monitors: vec!["10.0.0.1:6789".to_string()],
        rados_namespace: String::new(),
        ceph_fs: CephFsOptions::default(),
        read_affinity: ReadAffinity::default(),
    }]));

    let pool_cluster = cluster.clone();
    let connections = ConnectionPool::new(Box::new(move |_, _, _| {
        Ok(pool_cluster.clone() as Arc<dyn RadosCluster>)
    }));

    let backends = match kind {
        BackendKind::Rbd => Backends::Rbd(backend.clone()),
        BackendKind::CephFs => Backends::CephFs(backend.clone()),
    };

    let ctx = Arc::new(EngineContext {
        instance_id: "test".to_string(),
        registry,
        connections,
        volume_locks: VolumeLocks::new(),
        operation_locks: OperationLocks::new(),
        backends,
    });

    Harness {
        ctx,
        cluster,
        backend,
    }
}

fn secrets() -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert("userID".to_string(), "csi-user".to_string());
    map.insert("userKey".to_string(), "AQBuzODkTestKey==".to_string());
    map
}

fn rbd_params() -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert("clusterID".to_string(), "c1".to_string());
    map.insert("pool".to_string(), "rbd".to_string());
    map
}

fn create_params(name: &str, size: u64) -> CreateVolumeParams {
    CreateVolumeParams {
        name: name.to_string(),
        size_bytes: size,
        parameters: rbd_params(),
        secrets: secrets(),
        content_source: None,
    }
}

const GIB: u64 = 1 << 30;

#[tokio::test]
async fn test_simple_create_is_idempotent() {
    let h = harness(BackendKind::Rbd);
    let manager = VolumeManager::new(h.ctx.clone());

    let first = manager.create_volume(&create_params("pvc-1", GIB)).await.unwrap();
    assert!(!first.existing);
    assert!(first.volume_id.starts_with("v1-2-c1-"));
    assert!(first.image_name.starts_with("csi-vol-"));
    assert_eq!(h.backend.image_count(), 1);

    // Identical replay returns the same identifier and creates nothing.
    let second = manager.create_volume(&create_params("pvc-1", GIB)).await.unwrap();
    assert!(second.existing);
    assert_eq!(second.volume_id, first.volume_id);
    assert_eq!(second.image_name, first.image_name);
    assert_eq!(h.backend.image_count(), 1);

    // A different request name allocates a different volume.
    let other = manager.create_volume(&create_params("pvc-2", GIB)).await.unwrap();
    assert_ne!(other.volume_id, first.volume_id);
    assert_eq!(h.backend.image_count(), 2);
}

#[tokio::test]
async fn test_create_with_conflicting_size_is_rejected() {
    let h = harness(BackendKind::Rbd);
    let manager = VolumeManager::new(h.ctx.clone());

    manager.create_volume(&create_params("pvc-1", GIB)).await.unwrap();
    let err = manager
        .create_volume(&create_params("pvc-1", 2 * GIB))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));
}

#[tokio::test]
async fn test_racing_creates_abort_then_replay() {
    let h = harness(BackendKind::Rbd);
    let manager = VolumeManager::new(h.ctx.clone());

    // One in-flight create holds the request-name lock.
    let guard = h.ctx.volume_locks.try_acquire("pvc-1").unwrap();
    let err = manager
        .create_volume(&create_params("pvc-1", GIB))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Aborted(_)));
    drop(guard);

    // The winner provisions; the loser's replay sees the winner's result.
    let first = manager.create_volume(&create_params("pvc-1", GIB)).await.unwrap();
    let replay = manager.create_volume(&create_params("pvc-1", GIB)).await.unwrap();
    assert_eq!(replay.volume_id, first.volume_id);
    assert!(replay.existing);
}

#[tokio::test]
async fn test_delete_volume_round_trip() {
    let h = harness(BackendKind::Rbd);
    let manager = VolumeManager::new(h.ctx.clone());

    let created = manager.create_volume(&create_params("pvc-1", GIB)).await.unwrap();
    manager.delete_volume(&created.volume_id, &secrets()).await.unwrap();
    assert_eq!(h.backend.image_count(), 0);

    // Idempotent: a replayed delete succeeds.
    manager.delete_volume(&created.volume_id, &secrets()).await.unwrap();

    // The request name is free again.
    let recreated = manager.create_volume(&create_params("pvc-1", GIB)).await.unwrap();
    assert!(!recreated.existing);
    assert_ne!(recreated.volume_id, created.volume_id);
}

#[tokio::test]
async fn test_delete_with_undecodable_identifier_succeeds() {
    let h = harness(BackendKind::Rbd);
    let manager = VolumeManager::new(h.ctx.clone());

    // Old-format or garbage handles must not wedge cleanup.
    manager
        .delete_volume("some-legacy-handle", &secrets())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_expand_volume() {
    let h = harness(BackendKind::Rbd);
    let manager = VolumeManager::new(h.ctx.clone());

    let created = manager.create_volume(&create_params("pvc-1", GIB)).await.unwrap();

    let size = manager
        .expand_volume(&created.volume_id, 2 * GIB, &secrets())
        .await
        .unwrap();
    assert_eq!(size, 2 * GIB);

    // Shrinks and no-ops report the current size without a backend call.
    let size = manager
        .expand_volume(&created.volume_id, GIB, &secrets())
        .await
        .unwrap();
    assert_eq!(size, 2 * GIB);
}

#[tokio::test]
async fn test_snapshot_create_and_delete() {
    let h = harness(BackendKind::Rbd);
    let volumes = VolumeManager::new(h.ctx.clone());
    let snapshots = SnapshotManager::new(h.ctx.clone());

    let vol = volumes.create_volume(&create_params("pvc-1", GIB)).await.unwrap();

    let params = CreateSnapshotParams {
        name: "snap-req-1".to_string(),
        source_volume_id: vol.volume_id.clone(),
        parameters: rbd_params(),
        secrets: secrets(),
    };
    let snap = snapshots.create_snapshot(&params).await.unwrap();
    assert!(snap.ready);
    assert_eq!(snap.source_volume_id, vol.volume_id);
    assert_eq!(snap.size_bytes, GIB);
    assert_eq!(h.backend.image_snapshots("rbd", "", &vol.image_name).len(), 1);

    // Replay returns the same snapshot.
    let replay = snapshots.create_snapshot(&params).await.unwrap();
    assert_eq!(replay.snapshot_id, snap.snapshot_id);
    assert_eq!(h.backend.image_snapshots("rbd", "", &vol.image_name).len(), 1);

    snapshots.delete_snapshot(&snap.snapshot_id, &secrets()).await.unwrap();
    assert!(h.backend.image_snapshots("rbd", "", &vol.image_name).is_empty());
    // Idempotent replay.
    snapshots.delete_snapshot(&snap.snapshot_id, &secrets()).await.unwrap();
}

#[tokio::test]
async fn test_snapshots_pin_their_source_volume() {
    let h = harness(BackendKind::Rbd);
    let volumes = VolumeManager::new(h.ctx.clone());
    let snapshots = SnapshotManager::new(h.ctx.clone());

    let vol = volumes.create_volume(&create_params("pvc-1", GIB)).await.unwrap();
    let snap = snapshots
        .create_snapshot(&CreateSnapshotParams {
            name: "snap-req-1".to_string(),
            source_volume_id: vol.volume_id.clone(),
            parameters: rbd_params(),
            secrets: secrets(),
        })
        .await
        .unwrap();

    // The snapshot holds the volume.
    let err = volumes.delete_volume(&vol.volume_id, &secrets()).await.unwrap_err();
    assert!(matches!(err, EngineError::BackendPermanent(_)));

    snapshots.delete_snapshot(&snap.snapshot_id, &secrets()).await.unwrap();
    volumes.delete_volume(&vol.volume_id, &secrets()).await.unwrap();
    assert_eq!(h.backend.image_count(), 0);
}

#[tokio::test]
async fn test_clone_volume_and_source_delete_flattens() {
    let h = harness(BackendKind::Rbd);
    let volumes = VolumeManager::new(h.ctx.clone());

    let source = volumes.create_volume(&create_params("pvc-1", GIB)).await.unwrap();

    let mut clone_params = create_params("pvc-clone", GIB);
    clone_params.content_source = Some(ContentSource::Volume(source.volume_id.clone()));
    let clone = volumes.create_volume(&clone_params).await.unwrap();
    assert_eq!(h.backend.image_count(), 2);

    // The clone survives deletion of its source.
    volumes.delete_volume(&source.volume_id, &secrets()).await.unwrap();
    assert_eq!(h.backend.image_count(), 1);

    volumes.delete_volume(&clone.volume_id, &secrets()).await.unwrap();
    assert_eq!(h.backend.image_count(), 0);
}

#[tokio::test]
async fn test_restore_from_snapshot() {
    let h = harness(BackendKind::Rbd);
    let volumes = VolumeManager::new(h.ctx.clone());
    let snapshots = SnapshotManager::new(h.ctx.clone());

    let source = volumes.create_volume(&create_params("pvc-1", GIB)).await.unwrap();
    let snap = snapshots
        .create_snapshot(&CreateSnapshotParams {
            name: "snap-req-1".to_string(),
            source_volume_id: source.volume_id.clone(),
            parameters: rbd_params(),
            secrets: secrets(),
        })
        .await
        .unwrap();

    let mut restore_params = create_params("pvc-restored", GIB);
    restore_params.content_source = Some(ContentSource::Snapshot(snap.snapshot_id.clone()));
    let restored = volumes.create_volume(&restore_params).await.unwrap();
    assert_eq!(h.backend.image_count(), 2);

    // Deleting the snapshot flattens the restored volume first.
    snapshots.delete_snapshot(&snap.snapshot_id, &secrets()).await.unwrap();
    volumes.delete_volume(&restored.volume_id, &secrets()).await.unwrap();
    volumes.delete_volume(&source.volume_id, &secrets()).await.unwrap();
    assert_eq!(h.backend.image_count(), 0);
}

#[tokio::test]
async fn test_static_volume_create_is_rejected() {
    let h = harness(BackendKind::Rbd);
    let manager = VolumeManager::new(h.ctx.clone());

    let mut params = create_params("pvc-static", GIB);
    params
        .parameters
        .insert("staticVolume".to_string(), "true".to_string());
    let err = manager.create_volume(&params).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_group_snapshot_success() {
    let h = harness(BackendKind::Rbd);
    let volumes = VolumeManager::new(h.ctx.clone());
    let groups = GroupManager::new(h.ctx.clone());

    let mut member_ids = Vec::new();
    for name in ["pvc-1", "pvc-2", "pvc-3"] {
        member_ids.push(
            volumes
                .create_volume(&create_params(name, GIB))
                .await
                .unwrap()
                .volume_id,
        );
    }

    let result = groups
        .create_group_snapshot("group-1", &member_ids, &rbd_params(), &secrets())
        .await
        .unwrap();
    assert_eq!(result.snapshots.len(), 3);
    assert!(result.ready);

    // Replay returns the same group and members.
    let replay = groups
        .create_group_snapshot("group-1", &member_ids, &rbd_params(), &secrets())
        .await
        .unwrap();
    assert_eq!(replay.group_snapshot_id, result.group_snapshot_id);
    assert_eq!(replay.snapshots.len(), 3);

    let fetched = groups
        .get_group_snapshot(&result.group_snapshot_id, &secrets())
        .await
        .unwrap();
    assert_eq!(fetched.snapshots.len(), 3);

    groups
        .delete_group_snapshot(&result.group_snapshot_id, &secrets())
        .await
        .unwrap();
    // Members are deletable once their group snapshots are gone.
    for member_id in &member_ids {
        volumes.delete_volume(member_id, &secrets()).await.unwrap();
    }
}

#[tokio::test]
async fn test_group_snapshot_partial_failure_rolls_back() {
    let h = harness(BackendKind::Rbd);
    let volumes = VolumeManager::new(h.ctx.clone());
    let groups = GroupManager::new(h.ctx.clone());

    let mut member_ids = Vec::new();
    let mut image_names = Vec::new();
    for name in ["pvc-1", "pvc-2", "pvc-3"] {
        let created = volumes.create_volume(&create_params(name, GIB)).await.unwrap();
        member_ids.push(created.volume_id);
        image_names.push(created.image_name);
    }

    // The second member refuses to snapshot.
    h.backend.fail_snapshots_of(&image_names[1]);

    let err = groups
        .create_group_snapshot("group-1", &member_ids, &rbd_params(), &secrets())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BackendPermanent(_)));

    // No member snapshot survives the rollback.
    for image in &image_names {
        assert!(h.backend.image_snapshots("rbd", "", image).is_empty());
    }
    // No group journal entry survives either.
    let journal = Journal::group("test");
    let ioctx = h.cluster.io_ctx("rbd", "").await.unwrap();
    assert!(journal.check(&ioctx, "group-1").await.unwrap().is_none());
    // The per-member reservations were unwound too.
    let listing = h.cluster.objects_with_prefix("rbd", "", "csi.snap.");
    assert!(
        listing.is_empty(),
        "unexpected snapshot journal objects: {listing:?}"
    );
}

#[tokio::test]
async fn test_replication_lifecycle() {
    let h = harness(BackendKind::Rbd);
    let manager = VolumeManager::new(h.ctx.clone());

    let vol = manager.create_volume(&create_params("pvc-1", GIB)).await.unwrap();

    manager
        .enable_replication(&vol.volume_id, "snapshot", &secrets())
        .await
        .unwrap();
    manager.demote_volume(&vol.volume_id, &secrets()).await.unwrap();
    assert!(manager.resync_volume(&vol.volume_id, &secrets()).await.unwrap());
    manager
        .promote_volume(&vol.volume_id, false, &secrets())
        .await
        .unwrap();
    let status = manager
        .replication_info(&vol.volume_id, &secrets())
        .await
        .unwrap();
    assert!(status.up_to_date);
    manager
        .disable_replication(&vol.volume_id, false, &secrets())
        .await
        .unwrap();
}
