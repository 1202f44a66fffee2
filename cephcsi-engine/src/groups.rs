//! Atomic volume-group operations.
//!
//! Group operations compose the single-volume primitives under the group
//! journal with all-or-nothing semantics: either the group journal records
//! every member or it records nothing. A per-member failure unwinds the
//! members already processed, in reverse, before the group reservation is
//! undone.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::credentials::Credentials;
use crate::error::{EngineError, Result};
use crate::identifier::CsiIdentifier;
use crate::journal::Journal;
use crate::rados::RadosIoCtx;
use crate::registry::ClusterInfo;
use crate::volumes::options::PARAM_NAME_PREFIX;
use crate::volumes::{
    CreateSnapshotParams, EngineContext, SnapshotInfo, SnapshotManager, VolumeManager,
};

/// Result of a group snapshot create or lookup.
#[derive(Debug, Clone)]
pub struct GroupSnapshotResult {
    pub group_snapshot_id: String,
    pub group_name: String,
    pub snapshots: Vec<SnapshotInfo>,
    pub created_at: Option<DateTime<Utc>>,
    pub ready: bool,
}

/// The group lifecycle engine.
pub struct GroupManager {
    ctx: Arc<EngineContext>,
    snapshots: SnapshotManager,
}

impl GroupManager {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let snapshots = SnapshotManager::new(ctx.clone());
        Self { ctx, snapshots }
    }

    fn group_journal(&self) -> Journal {
        Journal::group(&self.ctx.instance_id)
    }

    /// Decode all member ids and insist they share one cluster and pool.
    fn decode_members(&self, member_ids: &[String]) -> Result<Vec<CsiIdentifier>> {
        if member_ids.is_empty() {
            return Err(EngineError::InvalidArgument(
                "a group operation needs at least one member volume".to_string(),
            ));
        }
        let members = member_ids
            .iter()
            .map(|id| CsiIdentifier::decode(id))
            .collect::<Result<Vec<_>>>()?;
        let first = &members[0];
        for member in &members[1..] {
            if member.cluster_id != first.cluster_id || member.location_id != first.location_id {
                return Err(EngineError::InvalidArgument(
                    "group members must share one cluster and pool".to_string(),
                ));
            }
        }
        Ok(members)
    }

    async fn open_for(
        &self,
        cluster: &ClusterInfo,
        creds: &Credentials,
        location_id: i64,
    ) -> Result<(crate::rados::ConnectionGuard, Arc<dyn RadosIoCtx>, String)> {
        let conn = self.ctx.connections.get(&cluster.mon_host(), creds)?;
        let pool = conn.cluster().pool_name(location_id).await?;
        let ioctx = conn
            .cluster()
            .io_ctx(&pool, &cluster.rados_namespace)
            .await?;
        Ok((conn, ioctx, pool))
    }

    /// Deterministic per-member request name, so replays of a partially
    /// completed group land on the same member reservations.
    fn member_request_name(group_request: &str, member: &CsiIdentifier) -> String {
        format!("{group_request}-{}", member.object_uuid)
    }

    /// Serve a create-group-snapshot request idempotently.
    #[instrument(skip(self, parameters, secrets), fields(request_name = %name, members = member_ids.len()))]
    pub async fn create_group_snapshot(
        &self,
        name: &str,
        member_ids: &[String],
        parameters: &HashMap<String, String>,
        secrets: &HashMap<String, String>,
    ) -> Result<GroupSnapshotResult> {
        let members = self.decode_members(member_ids)?;
        let cluster = self.ctx.registry.lookup(&members[0].cluster_id)?;
        let creds = Credentials::from_secrets(secrets)?;
        let _lock = self.ctx.volume_locks.try_acquire(name)?;
        let (_conn, ioctx, _pool) = self
            .open_for(&cluster, &creds, members[0].location_id)
            .await?;

        let journal = self.group_journal();

        // Idempotent replay path. A crash may have left the reservation
        // with only part of the member map; the replay finishes the
        // missing members before answering.
        if let Some(data) = journal.check(&ioctx, name).await? {
            let attrs = journal
                .get_volume_group_attributes(&ioctx, &data.object_uuid)
                .await?;
            let mut mapping = attrs.members.clone();
            let mut new_entries: BTreeMap<String, String> = BTreeMap::new();
            for (member_id, member) in member_ids.iter().zip(&members) {
                if !mapping.contains_key(member_id) {
                    let snapshot = self
                        .snapshots
                        .create_snapshot(&CreateSnapshotParams {
                            name: Self::member_request_name(name, member),
                            source_volume_id: member_id.clone(),
                            parameters: parameters.clone(),
                            secrets: secrets.clone(),
                        })
                        .await?;
                    new_entries.insert(member_id.clone(), snapshot.snapshot_id);
                }
            }
            if !new_entries.is_empty() {
                journal
                    .add_volumes_mapping(&ioctx, &data.object_uuid, &new_entries)
                    .await?;
                mapping.extend(new_entries);
            }
            let snapshots = self.collect_member_snapshots(&ioctx, &mapping).await?;
            let group_snapshot_id = CsiIdentifier::new(
                cluster.cluster_id.clone(),
                members[0].location_id,
                data.object_uuid,
            )
            .encode();
            info!(group_snapshot_id = %group_snapshot_id, "Group snapshot replayed from journal");
            return Ok(GroupSnapshotResult {
                group_snapshot_id,
                group_name: attrs.group_name,
                snapshots,
                created_at: data.created_at,
                ready: true,
            });
        }

        // Fresh group reservation.
        let name_prefix = parameters.get(PARAM_NAME_PREFIX).cloned();
        let (group_uuid, group_name) = journal
            .reserve(&ioctx, name, name_prefix.as_deref())
            .await?;

        let mut done: Vec<SnapshotInfo> = Vec::new();
        let mut mapping: BTreeMap<String, String> = BTreeMap::new();
        for (member_id, member) in member_ids.iter().zip(&members) {
            let member_params = CreateSnapshotParams {
                name: Self::member_request_name(name, member),
                source_volume_id: member_id.clone(),
                parameters: parameters.clone(),
                secrets: secrets.clone(),
            };
            match self.snapshots.create_snapshot(&member_params).await {
                Ok(snapshot) => {
                    mapping.insert(member_id.clone(), snapshot.snapshot_id.clone());
                    done.push(snapshot);
                }
                Err(e) => {
                    warn!(
                        member = %member_id,
                        error = %e,
                        "Member snapshot failed, unwinding the group"
                    );
                    // Reverse order: most recent success first.
                    for snapshot in done.iter().rev() {
                        if let Err(rollback_err) = self
                            .snapshots
                            .delete_snapshot(&snapshot.snapshot_id, secrets)
                            .await
                        {
                            warn!(
                                snapshot_id = %snapshot.snapshot_id,
                                error = %rollback_err,
                                "Rollback of member snapshot did not complete"
                            );
                        }
                    }
                    if let Err(undo_err) = journal.undo(&ioctx, &group_uuid, name).await {
                        warn!(error = %undo_err, "Group journal undo did not complete");
                    }
                    return Err(e);
                }
            }
        }

        journal
            .add_volumes_mapping(&ioctx, &group_uuid, &mapping)
            .await?;

        let group_snapshot_id = CsiIdentifier::new(
            cluster.cluster_id.clone(),
            members[0].location_id,
            group_uuid,
        )
        .encode();
        info!(
            group_snapshot_id = %group_snapshot_id,
            group = %group_name,
            members = done.len(),
            "Group snapshot created"
        );
        Ok(GroupSnapshotResult {
            group_snapshot_id,
            group_name,
            snapshots: done,
            created_at: Some(Utc::now()),
            ready: true,
        })
    }

    /// Serve a delete-group-snapshot request idempotently.
    #[instrument(skip(self, secrets), fields(group_snapshot_id = %group_snapshot_id))]
    pub async fn delete_group_snapshot(
        &self,
        group_snapshot_id: &str,
        secrets: &HashMap<String, String>,
    ) -> Result<()> {
        let id = match CsiIdentifier::decode(group_snapshot_id) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Undecodable identifier treated as already deleted");
                return Ok(());
            }
        };
        let cluster = self.ctx.registry.lookup(&id.cluster_id)?;
        let creds = Credentials::from_secrets(secrets)?;
        let _lock = self.ctx.volume_locks.try_acquire(group_snapshot_id)?;
        let (_conn, ioctx, _pool) = self.open_for(&cluster, &creds, id.location_id).await?;

        let journal = self.group_journal();
        let attrs = match journal
            .get_volume_group_attributes(&ioctx, &id.object_uuid)
            .await
        {
            Ok(attrs) => attrs,
            Err(EngineError::NotFound(_)) => {
                info!("No journal entry for group, delete is a no-op");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        for (member_id, snapshot_id) in &attrs.members {
            if snapshot_id.is_empty() {
                continue;
            }
            if let Err(e) = self.snapshots.delete_snapshot(snapshot_id, secrets).await {
                warn!(
                    member = %member_id,
                    snapshot_id = %snapshot_id,
                    error = %e,
                    "Member snapshot delete failed"
                );
                return Err(e);
            }
        }

        let member_keys: Vec<String> = attrs.members.keys().cloned().collect();
        if !member_keys.is_empty() {
            journal
                .remove_volumes_mapping(&ioctx, &id.object_uuid, &member_keys)
                .await?;
        }
        journal
            .undo(&ioctx, &id.object_uuid, &attrs.request_name)
            .await?;
        info!("Group snapshot deleted");
        Ok(())
    }

    /// Look up an existing group snapshot.
    pub async fn get_group_snapshot(
        &self,
        group_snapshot_id: &str,
        secrets: &HashMap<String, String>,
    ) -> Result<GroupSnapshotResult> {
        let id = CsiIdentifier::decode(group_snapshot_id)?;
        let cluster = self.ctx.registry.lookup(&id.cluster_id)?;
        let creds = Credentials::from_secrets(secrets)?;
        let (_conn, ioctx, _pool) = self.open_for(&cluster, &creds, id.location_id).await?;

        let journal = self.group_journal();
        let attrs = journal
            .get_volume_group_attributes(&ioctx, &id.object_uuid)
            .await?;
        let data = journal
            .get_by_uuid(&ioctx, &id.object_uuid)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("group snapshot {group_snapshot_id} not found"))
            })?;
        let snapshots = self.collect_member_snapshots(&ioctx, &attrs.members).await?;

        Ok(GroupSnapshotResult {
            group_snapshot_id: group_snapshot_id.to_string(),
            group_name: attrs.group_name,
            snapshots,
            created_at: data.created_at,
            ready: true,
        })
    }

    async fn collect_member_snapshots(
        &self,
        ioctx: &Arc<dyn RadosIoCtx>,
        members: &BTreeMap<String, String>,
    ) -> Result<Vec<SnapshotInfo>> {
        let snap_journal = Journal::snapshot(&self.ctx.instance_id);
        let mut snapshots = Vec::new();
        for (member_id, snapshot_id) in members {
            if snapshot_id.is_empty() {
                continue;
            }
            let snap = CsiIdentifier::decode(snapshot_id)?;
            let data = snap_journal
                .get_by_uuid(ioctx, &snap.object_uuid)
                .await?
                .ok_or_else(|| {
                    EngineError::StateInconsistent(format!(
                        "group member snapshot {snapshot_id} has no journal entry"
                    ))
                })?;
            snapshots.push(SnapshotInfo {
                snapshot_id: snapshot_id.clone(),
                source_volume_id: member_id.clone(),
                size_bytes: 0,
                created_at: data.created_at,
                ready: true,
            });
        }
        Ok(snapshots)
    }

    /// Enable mirroring for every member of a journaled group.
    ///
    /// The member mapping values are rewritten to the empty string, the
    /// group-replication convention, while the snapshot variant stores
    /// member snapshot ids.
    #[instrument(skip(self, secrets), fields(group_id = %group_id))]
    pub async fn enable_group_replication(
        &self,
        group_id: &str,
        mode: &str,
        secrets: &HashMap<String, String>,
    ) -> Result<()> {
        self.group_mirror(group_id, secrets, GroupMirrorOp::Enable(mode.to_string()))
            .await
    }

    /// Disable mirroring for every member of a journaled group.
    #[instrument(skip(self, secrets), fields(group_id = %group_id))]
    pub async fn disable_group_replication(
        &self,
        group_id: &str,
        force: bool,
        secrets: &HashMap<String, String>,
    ) -> Result<()> {
        self.group_mirror(group_id, secrets, GroupMirrorOp::Disable(force))
            .await
    }

    /// Promote every member of a journaled group.
    #[instrument(skip(self, secrets), fields(group_id = %group_id))]
    pub async fn promote_group(
        &self,
        group_id: &str,
        force: bool,
        secrets: &HashMap<String, String>,
    ) -> Result<()> {
        self.group_mirror(group_id, secrets, GroupMirrorOp::Promote(force))
            .await
    }

    /// Demote every member of a journaled group.
    #[instrument(skip(self, secrets), fields(group_id = %group_id))]
    pub async fn demote_group(
        &self,
        group_id: &str,
        secrets: &HashMap<String, String>,
    ) -> Result<()> {
        self.group_mirror(group_id, secrets, GroupMirrorOp::Demote).await
    }

    /// Resync every member of a journaled group; true when all are caught
    /// up.
    #[instrument(skip(self, secrets), fields(group_id = %group_id))]
    pub async fn resync_group(
        &self,
        group_id: &str,
        secrets: &HashMap<String, String>,
    ) -> Result<bool> {
        let manager = VolumeManager::new(self.ctx.clone());
        let mut ready = true;
        for member_id in self.group_member_ids(group_id, secrets).await? {
            ready &= manager.resync_volume(&member_id, secrets).await?;
        }
        Ok(ready)
    }

    async fn group_member_ids(
        &self,
        group_id: &str,
        secrets: &HashMap<String, String>,
    ) -> Result<Vec<String>> {
        let id = CsiIdentifier::decode(group_id)?;
        let cluster = self.ctx.registry.lookup(&id.cluster_id)?;
        let creds = Credentials::from_secrets(secrets)?;
        let (_conn, ioctx, _pool) = self.open_for(&cluster, &creds, id.location_id).await?;

        let attrs = self
            .group_journal()
            .get_volume_group_attributes(&ioctx, &id.object_uuid)
            .await?;
        if attrs.members.is_empty() {
            return Err(EngineError::NotFound(format!(
                "group {group_id} has no member volumes"
            )));
        }
        Ok(attrs.members.keys().cloned().collect())
    }

    async fn group_mirror(
        &self,
        group_id: &str,
        secrets: &HashMap<String, String>,
        op: GroupMirrorOp,
    ) -> Result<()> {
        let id = CsiIdentifier::decode(group_id)?;
        let cluster = self.ctx.registry.lookup(&id.cluster_id)?;
        let creds = Credentials::from_secrets(secrets)?;
        let (_conn, ioctx, _pool) = self.open_for(&cluster, &creds, id.location_id).await?;

        let journal = self.group_journal();
        let attrs = journal
            .get_volume_group_attributes(&ioctx, &id.object_uuid)
            .await?;
        if attrs.members.is_empty() {
            return Err(EngineError::NotFound(format!(
                "group {group_id} has no member volumes"
            )));
        }

        let manager = VolumeManager::new(self.ctx.clone());
        for member_id in attrs.members.keys() {
            match &op {
                GroupMirrorOp::Enable(mode) => {
                    manager.enable_replication(member_id, mode, secrets).await?
                }
                GroupMirrorOp::Disable(force) => {
                    manager
                        .disable_replication(member_id, *force, secrets)
                        .await?
                }
                GroupMirrorOp::Promote(force) => {
                    manager.promote_volume(member_id, *force, secrets).await?
                }
                GroupMirrorOp::Demote => manager.demote_volume(member_id, secrets).await?,
            }
        }

        // Replication groups store empty member values.
        let mapping: BTreeMap<String, String> = attrs
            .members
            .keys()
            .map(|k| (k.clone(), String::new()))
            .collect();
        journal
            .add_volumes_mapping(&ioctx, &id.object_uuid, &mapping)
            .await?;
        Ok(())
    }
}

/// One backend mirroring transition applied across a group.
enum GroupMirrorOp {
    Enable(String),
    Disable(bool),
    Promote(bool),
    Demote,
}
