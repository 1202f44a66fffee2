//! Volume and snapshot lifecycle engines.
//!
//! Every operation follows the same spine: resolve options and credentials,
//! take the in-process locks, consult the journal for the idempotency
//! verdict, dispatch to the backend, and commit or undo. The journal hit
//! path replays the stored answer without touching the backend creatively;
//! the miss path reserves first and cleans up on any later failure.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::backend::{CephConn, FsBackend, ImageBackend, MirrorStatus};
use crate::credentials::Credentials;
use crate::error::{EngineError, Result};
use crate::identifier::CsiIdentifier;
use crate::journal::{Journal, JournalData, ATTR_KMS_KEY, ATTR_SOURCE};
use crate::locks::{Operation, OperationLocks, VolumeLocks};
use crate::rados::{ConnectionGuard, ConnectionPool, RadosIoCtx};
use crate::reftracker::{RefTracker, RefType};
use crate::registry::{ClusterInfo, ClusterRegistry};
use crate::volumes::options::{BackendKind, VolumeOptions, PARAM_SNAPSHOT_NAME_PREFIX};

/// Filesystem name attribute on CephFS volume journal entries.
const ATTR_FS_NAME: &str = "csi.fsname";
/// Encryption marker attribute value.
const ATTR_ENCRYPTION_MARKER: &str = "encrypted";
/// Prefix of reference-tracker keys held by dependent volumes.
const REF_VOLUME_PREFIX: &str = "vol.";
/// Prefix of reference-tracker keys held by snapshots.
const REF_SNAPSHOT_PREFIX: &str = "snap.";
/// Budget for a single backend mirroring call.
const MIRROR_TIMEOUT: Duration = Duration::from_secs(60);

/// Backend dispatch: the RBD image path or the CephFS subvolume path.
///
/// Tagged variants, not an inheritance chain; the driver type picks one at
/// startup.
#[derive(Clone)]
pub enum Backends {
    Rbd(Arc<dyn ImageBackend>),
    CephFs(Arc<dyn FsBackend>),
}

impl Backends {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backends::Rbd(_) => BackendKind::Rbd,
            Backends::CephFs(_) => BackendKind::CephFs,
        }
    }
}

/// Shared state of all lifecycle managers in one daemon.
pub struct EngineContext {
    pub instance_id: String,
    pub registry: Arc<ClusterRegistry>,
    pub connections: Arc<ConnectionPool>,
    pub volume_locks: Arc<VolumeLocks>,
    pub operation_locks: Arc<OperationLocks>,
    pub backends: Backends,
}

impl EngineContext {
    fn volume_journal(&self) -> Journal {
        Journal::volume(&self.instance_id)
    }

    fn snapshot_journal(&self) -> Journal {
        Journal::snapshot(&self.instance_id)
    }
}

/// A volume source for create-from-existing requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentSource {
    Volume(String),
    Snapshot(String),
}

/// Inputs of a create-volume request.
#[derive(Debug, Clone)]
pub struct CreateVolumeParams {
    /// Orchestrator-chosen request name; the idempotency key.
    pub name: String,
    pub size_bytes: u64,
    pub parameters: HashMap<String, String>,
    pub secrets: HashMap<String, String>,
    pub content_source: Option<ContentSource>,
}

/// Result of a create-volume request.
#[derive(Debug, Clone)]
pub struct CreatedVolume {
    pub volume_id: String,
    pub size_bytes: u64,
    pub image_name: String,
    pub volume_context: HashMap<String, String>,
    /// Whether this was a replay of an existing reservation.
    pub existing: bool,
}

/// Inputs of a create-snapshot request.
#[derive(Debug, Clone)]
pub struct CreateSnapshotParams {
    /// Orchestrator-chosen request name; the idempotency key.
    pub name: String,
    pub source_volume_id: String,
    pub parameters: HashMap<String, String>,
    pub secrets: HashMap<String, String>,
}

/// A provisioned snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub snapshot_id: String,
    pub source_volume_id: String,
    pub size_bytes: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub ready: bool,
}

/// A volume resolved from its wire identifier.
struct ResolvedVolume {
    id: CsiIdentifier,
    cluster: ClusterInfo,
    pool: String,
    // Keeps the pooled connection alive for the duration of the request.
    _conn: ConnectionGuard,
    ioctx: Arc<dyn RadosIoCtx>,
    ceph: CephConn,
    data: JournalData,
    fs_name: Option<String>,
}

impl ResolvedVolume {
    fn fs_name(&self) -> Result<String> {
        self.fs_name.clone().ok_or_else(|| {
            EngineError::StateInconsistent(format!(
                "volume {} has no filesystem attribute",
                self.id.object_uuid
            ))
        })
    }
}

async fn mirror_call<T, F>(future: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(MIRROR_TIMEOUT, future).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::BackendTransient(
            "mirroring operation exceeded its budget".to_string(),
        )),
    }
}

/// The volume lifecycle engine.
pub struct VolumeManager {
    ctx: Arc<EngineContext>,
}

impl VolumeManager {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Open a connection and IO context for parsed options.
    async fn open(
        &self,
        options: &VolumeOptions,
        creds: &Credentials,
    ) -> Result<(ConnectionGuard, Arc<dyn RadosIoCtx>, CephConn)> {
        let conn = self
            .ctx
            .connections
            .get(&options.cluster.mon_host(), creds)?;
        let ioctx = conn
            .cluster()
            .io_ctx(&options.pool, options.rados_namespace())
            .await?;
        let ceph = CephConn::new(&options.cluster, creds)?;
        Ok((conn, ioctx, ceph))
    }

    /// Resolve a wire identifier into journal data and live handles.
    async fn resolve(
        &self,
        volume_id: &str,
        creds: &Credentials,
        journal: &Journal,
    ) -> Result<Option<ResolvedVolume>> {
        let id = CsiIdentifier::decode(volume_id)?;
        let cluster = self.ctx.registry.lookup(&id.cluster_id)?;
        let conn = self.ctx.connections.get(&cluster.mon_host(), creds)?;
        let pool = conn.cluster().pool_name(id.location_id).await?;
        let ioctx = conn
            .cluster()
            .io_ctx(&pool, &cluster.rados_namespace)
            .await?;

        let data = match journal.get_by_uuid(&ioctx, &id.object_uuid).await? {
            Some(data) => data,
            None => return Ok(None),
        };
        let fs_name = journal
            .get_attribute(&ioctx, &id.object_uuid, ATTR_FS_NAME)
            .await?;

        let ceph = CephConn::new(&cluster, creds)?;
        Ok(Some(ResolvedVolume {
            id,
            cluster,
            pool,
            _conn: conn,
            ioctx,
            ceph,
            data,
            fs_name,
        }))
    }

    fn volume_context(&self, options: &VolumeOptions, image_name: &str) -> HashMap<String, String> {
        let mut context = HashMap::new();
        context.insert("clusterID".to_string(), options.cluster.cluster_id.clone());
        context.insert("imageName".to_string(), image_name.to_string());
        if !options.cluster.rados_namespace.is_empty() {
            context.insert(
                "radosNamespace".to_string(),
                options.cluster.rados_namespace.clone(),
            );
        }
        match options.kind {
            BackendKind::Rbd => {
                context.insert("pool".to_string(), options.pool.clone());
            }
            BackendKind::CephFs => {
                if let Some(fs) = &options.fs_name {
                    context.insert("fsName".to_string(), fs.clone());
                }
                context.insert(
                    "subvolumeGroup".to_string(),
                    options.subvolume_group().to_string(),
                );
            }
        }
        context
    }

    /// Size of the backing resource, `None` when it does not exist.
    async fn backend_size(
        &self,
        options: &VolumeOptions,
        ceph: &CephConn,
        image_name: &str,
    ) -> Result<Option<u64>> {
        match (&self.ctx.backends, options.kind) {
            (Backends::Rbd(backend), BackendKind::Rbd) => Ok(backend
                .image_status(ceph, &options.pool, options.rados_namespace(), image_name)
                .await?
                .map(|s| s.size_bytes)),
            (Backends::CephFs(backend), BackendKind::CephFs) => {
                let fs = options.fs_name.as_deref().unwrap_or_default();
                Ok(backend
                    .subvolume_status(ceph, fs, options.subvolume_group(), image_name)
                    .await?
                    .map(|s| s.size_bytes))
            }
            _ => Err(EngineError::Internal(
                "backend kind does not match request kind".to_string(),
            )),
        }
    }

    /// Provision the backing resource for a fresh reservation.
    async fn provision(
        &self,
        options: &VolumeOptions,
        ceph: &CephConn,
        ioctx: &Arc<dyn RadosIoCtx>,
        uuid: &Uuid,
        image_name: &str,
        size_bytes: u64,
        source: Option<&ContentSource>,
    ) -> Result<()> {
        match source {
            None => match (&self.ctx.backends, options.kind) {
                (Backends::Rbd(backend), BackendKind::Rbd) => {
                    backend
                        .create_image(
                            ceph,
                            &options.pool,
                            options.rados_namespace(),
                            image_name,
                            size_bytes,
                            &options.image_features,
                        )
                        .await
                }
                (Backends::CephFs(backend), BackendKind::CephFs) => {
                    let fs = options.fs_name.as_deref().unwrap_or_default();
                    backend
                        .create_subvolume(
                            ceph,
                            fs,
                            options.subvolume_group(),
                            image_name,
                            size_bytes,
                        )
                        .await
                }
                _ => Err(EngineError::Internal(
                    "backend kind does not match request kind".to_string(),
                )),
            },
            Some(ContentSource::Snapshot(snapshot_id)) => {
                self.provision_from_snapshot(options, ceph, ioctx, uuid, image_name, snapshot_id)
                    .await
            }
            Some(ContentSource::Volume(source_volume_id)) => {
                self.provision_from_volume(
                    options,
                    ceph,
                    ioctx,
                    uuid,
                    image_name,
                    source_volume_id,
                )
                .await
            }
        }
    }

    async fn provision_from_snapshot(
        &self,
        options: &VolumeOptions,
        ceph: &CephConn,
        ioctx: &Arc<dyn RadosIoCtx>,
        uuid: &Uuid,
        image_name: &str,
        snapshot_id: &str,
    ) -> Result<()> {
        let snap_id = CsiIdentifier::decode(snapshot_id)?;
        if snap_id.cluster_id != options.cluster.cluster_id {
            return Err(EngineError::InvalidArgument(format!(
                "snapshot {snapshot_id} belongs to cluster {}, request targets {}",
                snap_id.cluster_id, options.cluster.cluster_id
            )));
        }

        // Restore keeps the clone inside the snapshot's pool.
        let _restore_lock = self
            .ctx
            .operation_locks
            .try_acquire(Operation::Restore, &snap_id.object_uuid.to_string())?;

        let snap_journal = self.ctx.snapshot_journal();
        let snap_data = snap_journal
            .get_by_uuid(ioctx, &snap_id.object_uuid)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("snapshot {snapshot_id} not found in journal"))
            })?;
        let source_volume_id = snap_data.source_id.clone().ok_or_else(|| {
            EngineError::StateInconsistent(format!(
                "snapshot {snapshot_id} has no source attribute"
            ))
        })?;
        let source_vol = CsiIdentifier::decode(&source_volume_id)?;
        let vol_journal = self.ctx.volume_journal();
        let source_data = vol_journal
            .get_by_uuid(ioctx, &source_vol.object_uuid)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "source volume of snapshot {snapshot_id} not found in journal"
                ))
            })?;

        match (&self.ctx.backends, options.kind) {
            (Backends::Rbd(backend), BackendKind::Rbd) => {
                backend
                    .clone_image(
                        ceph,
                        &options.pool,
                        options.rados_namespace(),
                        &source_data.image_name,
                        &snap_data.image_name,
                        image_name,
                        &options.image_features,
                    )
                    .await?;
            }
            (Backends::CephFs(backend), BackendKind::CephFs) => {
                let fs = options.fs_name.as_deref().unwrap_or_default();
                backend
                    .clone_subvolume_snapshot(
                        ceph,
                        fs,
                        options.subvolume_group(),
                        &source_data.image_name,
                        &snap_data.image_name,
                        image_name,
                    )
                    .await?;
            }
            _ => {
                return Err(EngineError::Internal(
                    "backend kind does not match request kind".to_string(),
                ))
            }
        }

        // Hold the snapshot alive while this volume depends on it.
        RefTracker::for_source(&snap_id.object_uuid)
            .ensure(ioctx, &[&format!("{REF_VOLUME_PREFIX}{uuid}")])
            .await
    }

    async fn provision_from_volume(
        &self,
        options: &VolumeOptions,
        ceph: &CephConn,
        ioctx: &Arc<dyn RadosIoCtx>,
        uuid: &Uuid,
        image_name: &str,
        source_volume_id: &str,
    ) -> Result<()> {
        let source_id = CsiIdentifier::decode(source_volume_id)?;
        if source_id.cluster_id != options.cluster.cluster_id {
            return Err(EngineError::InvalidArgument(format!(
                "source volume {source_volume_id} belongs to cluster {}, request targets {}",
                source_id.cluster_id, options.cluster.cluster_id
            )));
        }

        // A clone must not race a delete of its source.
        let _clone_lock = self
            .ctx
            .operation_locks
            .try_acquire(Operation::Clone, &source_id.object_uuid.to_string())?;

        let vol_journal = self.ctx.volume_journal();
        let source_data = vol_journal
            .get_by_uuid(ioctx, &source_id.object_uuid)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "source volume {source_volume_id} not found in journal"
                ))
            })?;

        let bridge_snapshot = format!("csi.clone.{uuid}");
        match (&self.ctx.backends, options.kind) {
            (Backends::Rbd(backend), BackendKind::Rbd) => {
                backend
                    .create_snapshot(
                        ceph,
                        &options.pool,
                        options.rados_namespace(),
                        &source_data.image_name,
                        &bridge_snapshot,
                    )
                    .await?;
                backend
                    .clone_image(
                        ceph,
                        &options.pool,
                        options.rados_namespace(),
                        &source_data.image_name,
                        &bridge_snapshot,
                        image_name,
                        &options.image_features,
                    )
                    .await?;
            }
            (Backends::CephFs(backend), BackendKind::CephFs) => {
                let fs = options.fs_name.as_deref().unwrap_or_default();
                backend
                    .create_subvolume_snapshot(
                        ceph,
                        fs,
                        options.subvolume_group(),
                        &source_data.image_name,
                        &bridge_snapshot,
                    )
                    .await?;
                backend
                    .clone_subvolume_snapshot(
                        ceph,
                        fs,
                        options.subvolume_group(),
                        &source_data.image_name,
                        &bridge_snapshot,
                        image_name,
                    )
                    .await?;
            }
            _ => {
                return Err(EngineError::Internal(
                    "backend kind does not match request kind".to_string(),
                ))
            }
        }

        RefTracker::for_source(&source_id.object_uuid)
            .ensure(ioctx, &[&format!("{REF_VOLUME_PREFIX}{uuid}")])
            .await
    }

    /// Undo a failed provision: backend artifact first, then the journal.
    async fn cleanup_failed_provision(
        &self,
        options: &VolumeOptions,
        ceph: &CephConn,
        ioctx: &Arc<dyn RadosIoCtx>,
        journal: &Journal,
        uuid: &Uuid,
        image_name: &str,
        request_name: &str,
    ) {
        let delete = async {
            match (&self.ctx.backends, options.kind) {
                (Backends::Rbd(backend), BackendKind::Rbd) => {
                    backend
                        .delete_image(ceph, &options.pool, options.rados_namespace(), image_name)
                        .await
                }
                (Backends::CephFs(backend), BackendKind::CephFs) => {
                    let fs = options.fs_name.as_deref().unwrap_or_default();
                    backend
                        .delete_subvolume(ceph, fs, options.subvolume_group(), image_name)
                        .await
                }
                _ => Ok(()),
            }
        };
        if let Err(e) = delete.await {
            warn!(
                request_name = %request_name,
                error = %e,
                "Backend cleanup after failed provision did not complete"
            );
        }
        if let Err(e) = journal.undo(ioctx, uuid, request_name).await {
            warn!(
                request_name = %request_name,
                error = %e,
                "Journal undo after failed provision did not complete"
            );
        }
    }

    /// Serve a create-volume request idempotently.
    #[instrument(skip(self, params), fields(request_name = %params.name, size_bytes = %params.size_bytes))]
    pub async fn create_volume(&self, params: &CreateVolumeParams) -> Result<CreatedVolume> {
        let options = VolumeOptions::from_params(
            &self.ctx.registry,
            &params.parameters,
            self.ctx.backends.kind(),
        )?;
        if options.static_volume {
            return Err(EngineError::InvalidArgument(
                "statically provisioned volumes are not created through this service".to_string(),
            ));
        }

        let creds = Credentials::from_secrets(&params.secrets)?;
        let _lock = self.ctx.volume_locks.try_acquire(&params.name)?;
        let (conn, ioctx, ceph) = self.open(&options, &creds).await?;
        let journal = self.ctx.volume_journal();

        // Idempotent replay path.
        if let Some(data) = journal.check(&ioctx, &params.name).await? {
            match self.backend_size(&options, &ceph, &data.image_name).await? {
                Some(existing_size) => {
                    if existing_size != params.size_bytes {
                        return Err(EngineError::AlreadyExists(format!(
                            "volume {} exists with size {existing_size}, request asks for {}",
                            params.name, params.size_bytes
                        )));
                    }
                    let requested_source = params.content_source.as_ref().map(|s| match s {
                        ContentSource::Volume(id) | ContentSource::Snapshot(id) => id.clone(),
                    });
                    if data.source_id != requested_source {
                        return Err(EngineError::AlreadyExists(format!(
                            "volume {} exists with a different content source",
                            params.name
                        )));
                    }

                    let pool_id = conn.cluster().pool_id(&options.pool).await?;
                    let volume_id = CsiIdentifier::new(
                        options.cluster.cluster_id.clone(),
                        pool_id,
                        data.object_uuid,
                    )
                    .encode();
                    info!(volume_id = %volume_id, "Create replayed from journal");
                    return Ok(CreatedVolume {
                        volume_id,
                        size_bytes: existing_size,
                        volume_context: self.volume_context(&options, &data.image_name),
                        image_name: data.image_name,
                        existing: true,
                    });
                }
                None => {
                    // The journal remembers a resource the backend lost;
                    // clear the reservation and provision afresh.
                    warn!(
                        request_name = %params.name,
                        "Journal entry without backing resource, re-provisioning"
                    );
                    journal
                        .undo(&ioctx, &data.object_uuid, &params.name)
                        .await?;
                }
            }
        }

        // Fresh reservation.
        let (uuid, image_name) = journal
            .reserve(&ioctx, &params.name, options.name_prefix.as_deref())
            .await?;

        let provisioned = self
            .provision(
                &options,
                &ceph,
                &ioctx,
                &uuid,
                &image_name,
                params.size_bytes,
                params.content_source.as_ref(),
            )
            .await;
        if let Err(e) = provisioned {
            self.cleanup_failed_provision(
                &options,
                &ceph,
                &ioctx,
                &journal,
                &uuid,
                &image_name,
                &params.name,
            )
            .await;
            return Err(e);
        }

        // Commit auxiliary attributes.
        let mut attributes: Vec<(&str, &str)> = Vec::new();
        let source_id = params.content_source.as_ref().map(|s| match s {
            ContentSource::Volume(id) | ContentSource::Snapshot(id) => id.clone(),
        });
        if let Some(source) = source_id.as_deref() {
            attributes.push((ATTR_SOURCE, source));
        }
        if options.encrypted {
            attributes.push((crate::journal::ATTR_ENCRYPTION, ATTR_ENCRYPTION_MARKER));
        }
        if let Some(kms) = options.kms_id.as_deref() {
            attributes.push((ATTR_KMS_KEY, kms));
        }
        let fs_name = options.fs_name.clone();
        if let Some(fs) = fs_name.as_deref() {
            attributes.push((ATTR_FS_NAME, fs));
        }
        if !attributes.is_empty() {
            if let Err(e) = journal.set_attributes(&ioctx, &uuid, &attributes).await {
                self.cleanup_failed_provision(
                    &options,
                    &ceph,
                    &ioctx,
                    &journal,
                    &uuid,
                    &image_name,
                    &params.name,
                )
                .await;
                return Err(e);
            }
        }

        let pool_id = conn.cluster().pool_id(&options.pool).await?;
        let volume_id =
            CsiIdentifier::new(options.cluster.cluster_id.clone(), pool_id, uuid).encode();
        info!(volume_id = %volume_id, image = %image_name, "Volume created");
        Ok(CreatedVolume {
            volume_id,
            size_bytes: params.size_bytes,
            volume_context: self.volume_context(&options, &image_name),
            image_name,
            existing: false,
        })
    }

    /// Serve a delete-volume request idempotently.
    ///
    /// An identifier that does not decode is treated as already deleted:
    /// older-format handles replayed after an upgrade must not wedge the
    /// orchestrator's cleanup loop.
    #[instrument(skip(self, secrets), fields(volume_id = %volume_id))]
    pub async fn delete_volume(
        &self,
        volume_id: &str,
        secrets: &HashMap<String, String>,
    ) -> Result<()> {
        let id = match CsiIdentifier::decode(volume_id) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Undecodable identifier treated as already deleted");
                return Ok(());
            }
        };

        let creds = Credentials::from_secrets(secrets)?;
        let _lock = self.ctx.volume_locks.try_acquire(volume_id)?;
        let _delete_lock = self
            .ctx
            .operation_locks
            .try_acquire(Operation::Delete, &id.object_uuid.to_string())?;

        let journal = self.ctx.volume_journal();
        let resolved = match self.resolve(volume_id, &creds, &journal).await? {
            Some(resolved) => resolved,
            None => {
                info!("No journal entry for volume, delete is a no-op");
                return Ok(());
            }
        };

        // Snapshots pin the volume; the orchestrator must delete them
        // first.
        let tracker = RefTracker::for_source(&id.object_uuid);
        if let Some(refs) = tracker.fetch(&resolved.ioctx).await? {
            let keys = refs.normal_keys();
            if keys.iter().any(|k| k.starts_with(REF_SNAPSHOT_PREFIX)) {
                return Err(EngineError::BackendPermanent(format!(
                    "volume {volume_id} still has snapshots"
                )));
            }
            // Dependent clones survive the source by flattening.
            for key in keys {
                let Some(child) = key.strip_prefix(REF_VOLUME_PREFIX) else {
                    continue;
                };
                let child_uuid = Uuid::parse_str(child).map_err(|e| {
                    EngineError::StateInconsistent(format!(
                        "tracker key {key} is not a volume UUID: {e}"
                    ))
                })?;
                if let Some(child_data) =
                    journal.get_by_uuid(&resolved.ioctx, &child_uuid).await?
                {
                    self.flatten(&resolved, &child_data.image_name).await?;
                }
            }
            resolved.ioctx.remove(tracker.object_name()).await?;
        }

        // Drop this volume's claim on its own source, if it was a clone or
        // a restore. The mask keeps a late replay of the original create
        // from resurrecting the reference.
        if let Some(source_id) = resolved.data.source_id.as_deref() {
            if let Ok(source) = CsiIdentifier::decode(source_id) {
                let mut release = BTreeMap::new();
                release.insert(
                    format!("{REF_VOLUME_PREFIX}{}", id.object_uuid),
                    RefType::Mask,
                );
                RefTracker::for_source(&source.object_uuid)
                    .release(&resolved.ioctx, &release)
                    .await?;
            }
        }

        self.delete_backend_volume(&resolved).await?;
        journal
            .undo(
                &resolved.ioctx,
                &id.object_uuid,
                &resolved.data.request_name,
            )
            .await?;
        info!("Volume deleted");
        Ok(())
    }

    async fn flatten(&self, resolved: &ResolvedVolume, image_name: &str) -> Result<()> {
        match &self.ctx.backends {
            Backends::Rbd(backend) => {
                backend
                    .flatten_image(
                        &resolved.ceph,
                        &resolved.pool,
                        &resolved.cluster.rados_namespace,
                        image_name,
                    )
                    .await
            }
            // Completed subvolume clones are already independent copies.
            Backends::CephFs(_) => Ok(()),
        }
    }

    async fn delete_backend_volume(&self, resolved: &ResolvedVolume) -> Result<()> {
        match &self.ctx.backends {
            Backends::Rbd(backend) => {
                backend
                    .delete_image(
                        &resolved.ceph,
                        &resolved.pool,
                        &resolved.cluster.rados_namespace,
                        &resolved.data.image_name,
                    )
                    .await
            }
            Backends::CephFs(backend) => {
                backend
                    .delete_subvolume(
                        &resolved.ceph,
                        &resolved.fs_name()?,
                        resolved.cluster.subvolume_group(),
                        &resolved.data.image_name,
                    )
                    .await
            }
        }
    }

    /// Serve an expand-volume request. Shrinking is refused; matching or
    /// smaller sizes succeed without touching the backend.
    #[instrument(skip(self, secrets), fields(volume_id = %volume_id, new_size_bytes = %new_size_bytes))]
    pub async fn expand_volume(
        &self,
        volume_id: &str,
        new_size_bytes: u64,
        secrets: &HashMap<String, String>,
    ) -> Result<u64> {
        let id = CsiIdentifier::decode(volume_id)?;
        let creds = Credentials::from_secrets(secrets)?;
        let _lock = self.ctx.volume_locks.try_acquire(volume_id)?;
        let _expand_lock = self
            .ctx
            .operation_locks
            .try_acquire(Operation::Expand, &id.object_uuid.to_string())?;

        let journal = self.ctx.volume_journal();
        let resolved = self
            .resolve(volume_id, &creds, &journal)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("volume {volume_id} not found")))?;

        let current = match &self.ctx.backends {
            Backends::Rbd(backend) => backend
                .image_status(
                    &resolved.ceph,
                    &resolved.pool,
                    &resolved.cluster.rados_namespace,
                    &resolved.data.image_name,
                )
                .await?
                .map(|s| s.size_bytes),
            Backends::CephFs(backend) => backend
                .subvolume_status(
                    &resolved.ceph,
                    &resolved.fs_name()?,
                    resolved.cluster.subvolume_group(),
                    &resolved.data.image_name,
                )
                .await?
                .map(|s| s.size_bytes),
        }
        .ok_or_else(|| {
            EngineError::NotFound(format!("backing resource of {volume_id} not found"))
        })?;

        if new_size_bytes <= current {
            return Ok(current);
        }

        match &self.ctx.backends {
            Backends::Rbd(backend) => {
                backend
                    .resize_image(
                        &resolved.ceph,
                        &resolved.pool,
                        &resolved.cluster.rados_namespace,
                        &resolved.data.image_name,
                        new_size_bytes,
                    )
                    .await?
            }
            Backends::CephFs(backend) => {
                backend
                    .resize_subvolume(
                        &resolved.ceph,
                        &resolved.fs_name()?,
                        resolved.cluster.subvolume_group(),
                        &resolved.data.image_name,
                        new_size_bytes,
                    )
                    .await?
            }
        }
        info!("Volume expanded");
        Ok(new_size_bytes)
    }

    fn rbd_backend(&self) -> Result<&Arc<dyn ImageBackend>> {
        match &self.ctx.backends {
            Backends::Rbd(backend) => Ok(backend),
            Backends::CephFs(_) => Err(EngineError::BackendPermanent(
                "replication requires the RBD backend".to_string(),
            )),
        }
    }

    /// Enable mirroring on a volume.
    #[instrument(skip(self, secrets), fields(volume_id = %volume_id))]
    pub async fn enable_replication(
        &self,
        volume_id: &str,
        mode: &str,
        secrets: &HashMap<String, String>,
    ) -> Result<()> {
        let creds = Credentials::from_secrets(secrets)?;
        let _lock = self.ctx.volume_locks.try_acquire(volume_id)?;
        let journal = self.ctx.volume_journal();
        let resolved = self
            .resolve(volume_id, &creds, &journal)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("volume {volume_id} not found")))?;
        let backend = self.rbd_backend()?;
        mirror_call(backend.mirror_enable(
            &resolved.ceph,
            &resolved.pool,
            &resolved.cluster.rados_namespace,
            &resolved.data.image_name,
            mode,
        ))
        .await
    }

    /// Disable mirroring on a volume.
    #[instrument(skip(self, secrets), fields(volume_id = %volume_id))]
    pub async fn disable_replication(
        &self,
        volume_id: &str,
        force: bool,
        secrets: &HashMap<String, String>,
    ) -> Result<()> {
        let creds = Credentials::from_secrets(secrets)?;
        let _lock = self.ctx.volume_locks.try_acquire(volume_id)?;
        let journal = self.ctx.volume_journal();
        let resolved = self
            .resolve(volume_id, &creds, &journal)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("volume {volume_id} not found")))?;
        let backend = self.rbd_backend()?;
        mirror_call(backend.mirror_disable(
            &resolved.ceph,
            &resolved.pool,
            &resolved.cluster.rados_namespace,
            &resolved.data.image_name,
            force,
        ))
        .await
    }

    /// Promote a mirrored volume to primary.
    #[instrument(skip(self, secrets), fields(volume_id = %volume_id))]
    pub async fn promote_volume(
        &self,
        volume_id: &str,
        force: bool,
        secrets: &HashMap<String, String>,
    ) -> Result<()> {
        let creds = Credentials::from_secrets(secrets)?;
        let _lock = self.ctx.volume_locks.try_acquire(volume_id)?;
        let journal = self.ctx.volume_journal();
        let resolved = self
            .resolve(volume_id, &creds, &journal)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("volume {volume_id} not found")))?;
        let backend = self.rbd_backend()?;
        mirror_call(backend.mirror_promote(
            &resolved.ceph,
            &resolved.pool,
            &resolved.cluster.rados_namespace,
            &resolved.data.image_name,
            force,
        ))
        .await
    }

    /// Demote a mirrored volume to secondary.
    #[instrument(skip(self, secrets), fields(volume_id = %volume_id))]
    pub async fn demote_volume(
        &self,
        volume_id: &str,
        secrets: &HashMap<String, String>,
    ) -> Result<()> {
        let creds = Credentials::from_secrets(secrets)?;
        let _lock = self.ctx.volume_locks.try_acquire(volume_id)?;
        let journal = self.ctx.volume_journal();
        let resolved = self
            .resolve(volume_id, &creds, &journal)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("volume {volume_id} not found")))?;
        let backend = self.rbd_backend()?;
        mirror_call(backend.mirror_demote(
            &resolved.ceph,
            &resolved.pool,
            &resolved.cluster.rados_namespace,
            &resolved.data.image_name,
        ))
        .await
    }

    /// Trigger a resync of a demoted volume; returns whether it has caught
    /// up.
    #[instrument(skip(self, secrets), fields(volume_id = %volume_id))]
    pub async fn resync_volume(
        &self,
        volume_id: &str,
        secrets: &HashMap<String, String>,
    ) -> Result<bool> {
        let creds = Credentials::from_secrets(secrets)?;
        let _lock = self.ctx.volume_locks.try_acquire(volume_id)?;
        let journal = self.ctx.volume_journal();
        let resolved = self
            .resolve(volume_id, &creds, &journal)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("volume {volume_id} not found")))?;
        let backend = self.rbd_backend()?;
        mirror_call(backend.mirror_resync(
            &resolved.ceph,
            &resolved.pool,
            &resolved.cluster.rados_namespace,
            &resolved.data.image_name,
        ))
        .await?;
        let status = mirror_call(backend.mirror_status(
            &resolved.ceph,
            &resolved.pool,
            &resolved.cluster.rados_namespace,
            &resolved.data.image_name,
        ))
        .await?;
        Ok(status.up_to_date)
    }

    /// Mirroring status of a volume.
    #[instrument(skip(self, secrets), fields(volume_id = %volume_id))]
    pub async fn replication_info(
        &self,
        volume_id: &str,
        secrets: &HashMap<String, String>,
    ) -> Result<MirrorStatus> {
        let creds = Credentials::from_secrets(secrets)?;
        let journal = self.ctx.volume_journal();
        let resolved = self
            .resolve(volume_id, &creds, &journal)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("volume {volume_id} not found")))?;
        let backend = self.rbd_backend()?;
        mirror_call(backend.mirror_status(
            &resolved.ceph,
            &resolved.pool,
            &resolved.cluster.rados_namespace,
            &resolved.data.image_name,
        ))
        .await
    }
}

/// The snapshot lifecycle engine.
pub struct SnapshotManager {
    ctx: Arc<EngineContext>,
}

impl SnapshotManager {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Serve a create-snapshot request idempotently.
    #[instrument(skip(self, params), fields(request_name = %params.name, source = %params.source_volume_id))]
    pub async fn create_snapshot(&self, params: &CreateSnapshotParams) -> Result<SnapshotInfo> {
        let source_id = CsiIdentifier::decode(&params.source_volume_id)?;
        let cluster = self.ctx.registry.lookup(&source_id.cluster_id)?;
        let creds = Credentials::from_secrets(&params.secrets)?;

        let _lock = self.ctx.volume_locks.try_acquire(&params.name)?;
        // Keep the source from being deleted while the snapshot is cut.
        let _source_lock = self
            .ctx
            .operation_locks
            .try_acquire(Operation::Clone, &source_id.object_uuid.to_string())?;

        let conn = self.ctx.connections.get(&cluster.mon_host(), &creds)?;
        let pool = conn.cluster().pool_name(source_id.location_id).await?;
        let ioctx = conn
            .cluster()
            .io_ctx(&pool, &cluster.rados_namespace)
            .await?;
        let ceph = CephConn::new(&cluster, &creds)?;

        let vol_journal = self.ctx.volume_journal();
        let source_data = vol_journal
            .get_by_uuid(&ioctx, &source_id.object_uuid)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "source volume {} not found",
                    params.source_volume_id
                ))
            })?;
        let fs_name = vol_journal
            .get_attribute(&ioctx, &source_id.object_uuid, ATTR_FS_NAME)
            .await?;
        let source_size = self
            .snapshot_source_size(&ceph, &cluster, &pool, fs_name.as_deref(), &source_data)
            .await?;

        let snap_journal = self.ctx.snapshot_journal();
        let name_prefix = params.parameters.get(PARAM_SNAPSHOT_NAME_PREFIX).cloned();

        // Idempotent replay path.
        if let Some(data) = snap_journal.check(&ioctx, &params.name).await? {
            if data.source_id.as_deref() != Some(params.source_volume_id.as_str()) {
                return Err(EngineError::AlreadyExists(format!(
                    "snapshot {} exists for a different source volume",
                    params.name
                )));
            }
            let exists = self
                .backend_snapshot_exists(
                    &ceph,
                    &cluster,
                    &pool,
                    fs_name.as_deref(),
                    &source_data.image_name,
                    &data.image_name,
                )
                .await?;
            if exists {
                let snapshot_id = CsiIdentifier::new(
                    cluster.cluster_id.clone(),
                    source_id.location_id,
                    data.object_uuid,
                )
                .encode();
                info!(snapshot_id = %snapshot_id, "Snapshot create replayed from journal");
                return Ok(SnapshotInfo {
                    snapshot_id,
                    source_volume_id: params.source_volume_id.clone(),
                    size_bytes: source_size,
                    created_at: data.created_at,
                    ready: true,
                });
            }
            warn!(
                request_name = %params.name,
                "Snapshot journal entry without backing snapshot, re-provisioning"
            );
            snap_journal
                .undo(&ioctx, &data.object_uuid, &params.name)
                .await?;
        }

        // Fresh reservation.
        let (uuid, snap_name) = snap_journal
            .reserve(&ioctx, &params.name, name_prefix.as_deref())
            .await?;

        let created = self
            .backend_create_snapshot(
                &ceph,
                &cluster,
                &pool,
                fs_name.as_deref(),
                &source_data.image_name,
                &snap_name,
            )
            .await;
        if let Err(e) = created {
            if let Err(undo_err) = snap_journal.undo(&ioctx, &uuid, &params.name).await {
                warn!(error = %undo_err, "Journal undo after failed snapshot did not complete");
            }
            return Err(e);
        }

        let mut attributes = vec![(ATTR_SOURCE, params.source_volume_id.as_str())];
        if let Some(fs) = fs_name.as_deref() {
            attributes.push((ATTR_FS_NAME, fs));
        }
        if let Err(e) = snap_journal.set_attributes(&ioctx, &uuid, &attributes).await {
            if let Err(cleanup_err) = self
                .backend_delete_snapshot(
                    &ceph,
                    &cluster,
                    &pool,
                    fs_name.as_deref(),
                    &source_data.image_name,
                    &snap_name,
                )
                .await
            {
                warn!(error = %cleanup_err, "Snapshot cleanup after failed commit did not complete");
            }
            if let Err(undo_err) = snap_journal.undo(&ioctx, &uuid, &params.name).await {
                warn!(error = %undo_err, "Journal undo after failed commit did not complete");
            }
            return Err(e);
        }

        // Pin the source volume while the snapshot exists.
        RefTracker::for_source(&source_id.object_uuid)
            .ensure(&ioctx, &[&format!("{REF_SNAPSHOT_PREFIX}{uuid}")])
            .await?;

        let snapshot_id =
            CsiIdentifier::new(cluster.cluster_id.clone(), source_id.location_id, uuid).encode();
        info!(snapshot_id = %snapshot_id, snapshot = %snap_name, "Snapshot created");
        Ok(SnapshotInfo {
            snapshot_id,
            source_volume_id: params.source_volume_id.clone(),
            size_bytes: source_size,
            created_at: Some(Utc::now()),
            ready: true,
        })
    }

    /// Serve a delete-snapshot request idempotently. Undecodable
    /// identifiers report success, mirroring volume deletion.
    #[instrument(skip(self, secrets), fields(snapshot_id = %snapshot_id))]
    pub async fn delete_snapshot(
        &self,
        snapshot_id: &str,
        secrets: &HashMap<String, String>,
    ) -> Result<()> {
        let id = match CsiIdentifier::decode(snapshot_id) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Undecodable identifier treated as already deleted");
                return Ok(());
            }
        };
        let cluster = self.ctx.registry.lookup(&id.cluster_id)?;
        let creds = Credentials::from_secrets(secrets)?;

        let _lock = self.ctx.volume_locks.try_acquire(snapshot_id)?;
        let _delete_lock = self
            .ctx
            .operation_locks
            .try_acquire(Operation::Delete, &id.object_uuid.to_string())?;

        let conn = self.ctx.connections.get(&cluster.mon_host(), &creds)?;
        let pool = conn.cluster().pool_name(id.location_id).await?;
        let ioctx = conn
            .cluster()
            .io_ctx(&pool, &cluster.rados_namespace)
            .await?;
        let ceph = CephConn::new(&cluster, &creds)?;

        let snap_journal = self.ctx.snapshot_journal();
        let data = match snap_journal.get_by_uuid(&ioctx, &id.object_uuid).await? {
            Some(data) => data,
            None => {
                info!("No journal entry for snapshot, delete is a no-op");
                return Ok(());
            }
        };
        let fs_name = snap_journal
            .get_attribute(&ioctx, &id.object_uuid, ATTR_FS_NAME)
            .await?;

        // Volumes restored from this snapshot keep their data by
        // flattening before the snapshot goes away.
        let tracker = RefTracker::for_source(&id.object_uuid);
        if let Some(refs) = tracker.fetch(&ioctx).await? {
            let vol_journal = self.ctx.volume_journal();
            for key in refs.normal_keys() {
                let Some(child) = key.strip_prefix(REF_VOLUME_PREFIX) else {
                    continue;
                };
                if let Ok(child_uuid) = Uuid::parse_str(child) {
                    if let Some(child_data) = vol_journal.get_by_uuid(&ioctx, &child_uuid).await? {
                        if let Backends::Rbd(backend) = &self.ctx.backends {
                            backend
                                .flatten_image(
                                    &ceph,
                                    &pool,
                                    &cluster.rados_namespace,
                                    &child_data.image_name,
                                )
                                .await?;
                        }
                    }
                }
            }
            ioctx.remove(tracker.object_name()).await?;
        }

        // The backend snapshot lives on its source volume; a vanished
        // source already took the snapshot with it.
        if let Some(source_id) = data.source_id.as_deref() {
            if let Ok(source) = CsiIdentifier::decode(source_id) {
                let vol_journal = self.ctx.volume_journal();
                if let Some(source_data) = vol_journal
                    .get_by_uuid(&ioctx, &source.object_uuid)
                    .await?
                {
                    self.backend_delete_snapshot(
                        &ceph,
                        &cluster,
                        &pool,
                        fs_name.as_deref(),
                        &source_data.image_name,
                        &data.image_name,
                    )
                    .await?;
                }

                // Unpin the source; mask so a late create replay cannot
                // re-add this snapshot's claim.
                let mut release = BTreeMap::new();
                release.insert(
                    format!("{REF_SNAPSHOT_PREFIX}{}", id.object_uuid),
                    RefType::Mask,
                );
                RefTracker::for_source(&source.object_uuid)
                    .release(&ioctx, &release)
                    .await?;
            }
        }

        snap_journal
            .undo(&ioctx, &id.object_uuid, &data.request_name)
            .await?;
        info!("Snapshot deleted");
        Ok(())
    }

    async fn snapshot_source_size(
        &self,
        ceph: &CephConn,
        cluster: &ClusterInfo,
        pool: &str,
        fs_name: Option<&str>,
        source: &JournalData,
    ) -> Result<u64> {
        match &self.ctx.backends {
            Backends::Rbd(backend) => backend
                .image_status(ceph, pool, &cluster.rados_namespace, &source.image_name)
                .await?
                .map(|s| s.size_bytes)
                .ok_or_else(|| {
                    EngineError::NotFound(format!(
                        "backing image of {} not found",
                        source.image_name
                    ))
                }),
            Backends::CephFs(backend) => backend
                .subvolume_status(
                    ceph,
                    fs_name.unwrap_or_default(),
                    cluster.subvolume_group(),
                    &source.image_name,
                )
                .await?
                .map(|s| s.size_bytes)
                .ok_or_else(|| {
                    EngineError::NotFound(format!(
                        "backing subvolume of {} not found",
                        source.image_name
                    ))
                }),
        }
    }

    async fn backend_create_snapshot(
        &self,
        ceph: &CephConn,
        cluster: &ClusterInfo,
        pool: &str,
        fs_name: Option<&str>,
        image_name: &str,
        snap_name: &str,
    ) -> Result<()> {
        match &self.ctx.backends {
            Backends::Rbd(backend) => {
                backend
                    .create_snapshot(ceph, pool, &cluster.rados_namespace, image_name, snap_name)
                    .await
            }
            Backends::CephFs(backend) => {
                backend
                    .create_subvolume_snapshot(
                        ceph,
                        fs_name.unwrap_or_default(),
                        cluster.subvolume_group(),
                        image_name,
                        snap_name,
                    )
                    .await
            }
        }
    }

    async fn backend_delete_snapshot(
        &self,
        ceph: &CephConn,
        cluster: &ClusterInfo,
        pool: &str,
        fs_name: Option<&str>,
        image_name: &str,
        snap_name: &str,
    ) -> Result<()> {
        match &self.ctx.backends {
            Backends::Rbd(backend) => {
                backend
                    .delete_snapshot(ceph, pool, &cluster.rados_namespace, image_name, snap_name)
                    .await
            }
            Backends::CephFs(backend) => {
                backend
                    .delete_subvolume_snapshot(
                        ceph,
                        fs_name.unwrap_or_default(),
                        cluster.subvolume_group(),
                        image_name,
                        snap_name,
                    )
                    .await
            }
        }
    }

    async fn backend_snapshot_exists(
        &self,
        ceph: &CephConn,
        cluster: &ClusterInfo,
        pool: &str,
        fs_name: Option<&str>,
        image_name: &str,
        snap_name: &str,
    ) -> Result<bool> {
        match &self.ctx.backends {
            Backends::Rbd(backend) => {
                backend
                    .snapshot_exists(ceph, pool, &cluster.rados_namespace, image_name, snap_name)
                    .await
            }
            Backends::CephFs(backend) => {
                backend
                    .subvolume_snapshot_exists(
                        ceph,
                        fs_name.unwrap_or_default(),
                        cluster.subvolume_group(),
                        image_name,
                        snap_name,
                    )
                    .await
            }
        }
    }
}
