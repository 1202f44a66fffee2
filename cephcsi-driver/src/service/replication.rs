//! Volume-replication extension service implementation.
//!
//! Requests may target a single volume or a journaled group; the handle
//! itself does not say which, so the volume journal is consulted first and
//! the group journal second.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::instrument;

use cephcsi_engine::{EngineContext, EngineError, GroupManager, VolumeManager};
use cephcsi_proto::replication::{
    DemoteVolumeRequest, DemoteVolumeResponse, DisableVolumeReplicationRequest,
    DisableVolumeReplicationResponse, EnableVolumeReplicationRequest,
    EnableVolumeReplicationResponse, GetVolumeReplicationInfoRequest,
    GetVolumeReplicationInfoResponse, PromoteVolumeRequest, PromoteVolumeResponse, Replication,
    ResyncVolumeRequest, ResyncVolumeResponse,
};

use crate::service::timestamp;
use crate::status::status_from;

/// Mirroring mode parameter; `snapshot` unless the storage class says
/// otherwise.
const PARAM_MIRRORING_MODE: &str = "mirroringMode";
const DEFAULT_MIRRORING_MODE: &str = "snapshot";

/// Replication service: mirror lifecycle for volumes and groups.
pub struct ReplicationService {
    volumes: VolumeManager,
    groups: GroupManager,
}

impl ReplicationService {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            volumes: VolumeManager::new(ctx.clone()),
            groups: GroupManager::new(ctx),
        }
    }
}

/// Fall back to the group path only when the volume journal knows nothing
/// about the handle.
fn is_not_found(err: &EngineError) -> bool {
    matches!(err, EngineError::NotFound(_))
}

#[tonic::async_trait]
impl Replication for ReplicationService {
    #[instrument(skip(self, request))]
    async fn enable_volume_replication(
        &self,
        request: Request<EnableVolumeReplicationRequest>,
    ) -> Result<Response<EnableVolumeReplicationResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume id must be set"));
        }
        let mode = req
            .parameters
            .get(PARAM_MIRRORING_MODE)
            .map(|m| m.as_str())
            .unwrap_or(DEFAULT_MIRRORING_MODE)
            .to_string();

        match self
            .volumes
            .enable_replication(&req.volume_id, &mode, &req.secrets)
            .await
        {
            Ok(()) => {}
            Err(e) if is_not_found(&e) => {
                self.groups
                    .enable_group_replication(&req.volume_id, &mode, &req.secrets)
                    .await
                    .map_err(status_from)?;
            }
            Err(e) => return Err(status_from(e)),
        }
        Ok(Response::new(EnableVolumeReplicationResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn disable_volume_replication(
        &self,
        request: Request<DisableVolumeReplicationRequest>,
    ) -> Result<Response<DisableVolumeReplicationResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume id must be set"));
        }
        match self
            .volumes
            .disable_replication(&req.volume_id, false, &req.secrets)
            .await
        {
            Ok(()) => {}
            Err(e) if is_not_found(&e) => {
                self.groups
                    .disable_group_replication(&req.volume_id, false, &req.secrets)
                    .await
                    .map_err(status_from)?;
            }
            Err(e) => return Err(status_from(e)),
        }
        Ok(Response::new(DisableVolumeReplicationResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn promote_volume(
        &self,
        request: Request<PromoteVolumeRequest>,
    ) -> Result<Response<PromoteVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume id must be set"));
        }
        match self
            .volumes
            .promote_volume(&req.volume_id, req.force, &req.secrets)
            .await
        {
            Ok(()) => {}
            Err(e) if is_not_found(&e) => {
                self.groups
                    .promote_group(&req.volume_id, req.force, &req.secrets)
                    .await
                    .map_err(status_from)?;
            }
            Err(e) => return Err(status_from(e)),
        }
        Ok(Response::new(PromoteVolumeResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn demote_volume(
        &self,
        request: Request<DemoteVolumeRequest>,
    ) -> Result<Response<DemoteVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume id must be set"));
        }
        match self.volumes.demote_volume(&req.volume_id, &req.secrets).await {
            Ok(()) => {}
            Err(e) if is_not_found(&e) => {
                self.groups
                    .demote_group(&req.volume_id, &req.secrets)
                    .await
                    .map_err(status_from)?;
            }
            Err(e) => return Err(status_from(e)),
        }
        Ok(Response::new(DemoteVolumeResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn resync_volume(
        &self,
        request: Request<ResyncVolumeRequest>,
    ) -> Result<Response<ResyncVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume id must be set"));
        }
        let ready = match self.volumes.resync_volume(&req.volume_id, &req.secrets).await {
            Ok(ready) => ready,
            Err(e) if is_not_found(&e) => self
                .groups
                .resync_group(&req.volume_id, &req.secrets)
                .await
                .map_err(status_from)?,
            Err(e) => return Err(status_from(e)),
        };
        Ok(Response::new(ResyncVolumeResponse { ready }))
    }

    async fn get_volume_replication_info(
        &self,
        request: Request<GetVolumeReplicationInfoRequest>,
    ) -> Result<Response<GetVolumeReplicationInfoResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume id must be set"));
        }
        let status = self
            .volumes
            .replication_info(&req.volume_id, &req.secrets)
            .await
            .map_err(status_from)?;
        Ok(Response::new(GetVolumeReplicationInfoResponse {
            last_sync_time: status.last_sync.map(timestamp),
            status_message: status.description,
        }))
    }
}
