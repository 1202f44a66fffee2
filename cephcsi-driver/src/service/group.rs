//! CSI GroupController service implementation.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::instrument;

use cephcsi_engine::{EngineContext, GroupManager, GroupSnapshotResult};
use cephcsi_proto::csi::{
    group_controller_service_capability, CreateVolumeGroupSnapshotRequest,
    CreateVolumeGroupSnapshotResponse, DeleteVolumeGroupSnapshotRequest,
    DeleteVolumeGroupSnapshotResponse, GetVolumeGroupSnapshotRequest,
    GetVolumeGroupSnapshotResponse, GroupController, GroupControllerGetCapabilitiesRequest,
    GroupControllerGetCapabilitiesResponse, GroupControllerServiceCapability, Snapshot,
    VolumeGroupSnapshot,
};

use crate::service::timestamp;
use crate::status::status_from;

/// GroupController service: atomic multi-volume snapshots.
pub struct GroupService {
    groups: GroupManager,
}

impl GroupService {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            groups: GroupManager::new(ctx),
        }
    }
}

fn group_snapshot_response(result: GroupSnapshotResult) -> VolumeGroupSnapshot {
    VolumeGroupSnapshot {
        group_snapshot_id: result.group_snapshot_id.clone(),
        snapshots: result
            .snapshots
            .into_iter()
            .map(|snapshot| Snapshot {
                snapshot_id: snapshot.snapshot_id,
                source_volume_id: snapshot.source_volume_id,
                size_bytes: snapshot.size_bytes as i64,
                creation_time: snapshot.created_at.map(timestamp),
                ready_to_use: snapshot.ready,
                group_snapshot_id: result.group_snapshot_id.clone(),
            })
            .collect(),
        creation_time: result.created_at.map(timestamp),
        ready_to_use: result.ready,
    }
}

#[tonic::async_trait]
impl GroupController for GroupService {
    async fn group_controller_get_capabilities(
        &self,
        _request: Request<GroupControllerGetCapabilitiesRequest>,
    ) -> Result<Response<GroupControllerGetCapabilitiesResponse>, Status> {
        Ok(Response::new(GroupControllerGetCapabilitiesResponse {
            capabilities: vec![GroupControllerServiceCapability {
                r#type: Some(group_controller_service_capability::Type::Rpc(
                    group_controller_service_capability::Rpc {
                        r#type:
                            group_controller_service_capability::rpc::Type::CreateDeleteGetVolumeGroupSnapshot
                                as i32,
                    },
                )),
            }],
        }))
    }

    #[instrument(skip(self, request))]
    async fn create_volume_group_snapshot(
        &self,
        request: Request<CreateVolumeGroupSnapshotRequest>,
    ) -> Result<Response<CreateVolumeGroupSnapshotResponse>, Status> {
        let req = request.into_inner();
        if req.name.is_empty() {
            return Err(Status::invalid_argument("group snapshot name must be set"));
        }
        if req.source_volume_ids.is_empty() {
            return Err(Status::invalid_argument(
                "source volume ids must be provided",
            ));
        }

        let result = self
            .groups
            .create_group_snapshot(&req.name, &req.source_volume_ids, &req.parameters, &req.secrets)
            .await
            .map_err(status_from)?;

        Ok(Response::new(CreateVolumeGroupSnapshotResponse {
            group_snapshot: Some(group_snapshot_response(result)),
        }))
    }

    #[instrument(skip(self, request))]
    async fn delete_volume_group_snapshot(
        &self,
        request: Request<DeleteVolumeGroupSnapshotRequest>,
    ) -> Result<Response<DeleteVolumeGroupSnapshotResponse>, Status> {
        let req = request.into_inner();
        if req.group_snapshot_id.is_empty() {
            return Err(Status::invalid_argument("group snapshot id must be set"));
        }
        self.groups
            .delete_group_snapshot(&req.group_snapshot_id, &req.secrets)
            .await
            .map_err(status_from)?;
        Ok(Response::new(DeleteVolumeGroupSnapshotResponse {}))
    }

    async fn get_volume_group_snapshot(
        &self,
        request: Request<GetVolumeGroupSnapshotRequest>,
    ) -> Result<Response<GetVolumeGroupSnapshotResponse>, Status> {
        let req = request.into_inner();
        if req.group_snapshot_id.is_empty() {
            return Err(Status::invalid_argument("group snapshot id must be set"));
        }
        let result = self
            .groups
            .get_group_snapshot(&req.group_snapshot_id, &req.secrets)
            .await
            .map_err(status_from)?;
        Ok(Response::new(GetVolumeGroupSnapshotResponse {
            group_snapshot: Some(group_snapshot_response(result)),
        }))
    }
}
