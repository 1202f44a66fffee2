//! CSI Controller service implementation.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::instrument;

use cephcsi_engine::{
    ContentSource, CreateSnapshotParams, CreateVolumeParams, CsiIdentifier, EngineContext,
    SnapshotManager, VolumeManager,
};
use cephcsi_proto::csi::{
    controller_service_capability, volume_content_source, Controller,
    ControllerExpandVolumeRequest, ControllerExpandVolumeResponse,
    ControllerGetCapabilitiesRequest, ControllerGetCapabilitiesResponse,
    ControllerPublishVolumeRequest, ControllerPublishVolumeResponse,
    ControllerServiceCapability, ControllerUnpublishVolumeRequest,
    ControllerUnpublishVolumeResponse, CreateSnapshotRequest, CreateSnapshotResponse,
    CreateVolumeRequest, CreateVolumeResponse, DeleteSnapshotRequest, DeleteSnapshotResponse,
    DeleteVolumeRequest, DeleteVolumeResponse, Snapshot, ValidateVolumeCapabilitiesRequest,
    ValidateVolumeCapabilitiesResponse, Volume, VolumeContentSource,
};

use crate::config::DriverType;
use crate::service::timestamp;
use crate::status::status_from;

/// Default size when a request names no capacity: 1 GiB.
const DEFAULT_VOLUME_SIZE: i64 = 1 << 30;

/// Controller service: provisioning, snapshots, expansion.
pub struct ControllerService {
    volumes: VolumeManager,
    snapshots: SnapshotManager,
    driver_type: DriverType,
}

impl ControllerService {
    pub fn new(ctx: Arc<EngineContext>, driver_type: DriverType) -> Self {
        Self {
            volumes: VolumeManager::new(ctx.clone()),
            snapshots: SnapshotManager::new(ctx),
            driver_type,
        }
    }
}

fn requested_size(range: Option<&cephcsi_proto::csi::CapacityRange>) -> Result<u64, Status> {
    let size = match range {
        Some(range) if range.required_bytes > 0 => range.required_bytes,
        Some(range) if range.limit_bytes > 0 => range.limit_bytes,
        _ => DEFAULT_VOLUME_SIZE,
    };
    u64::try_from(size)
        .map_err(|_| Status::invalid_argument("capacity range must not be negative"))
}

fn content_source(
    source: Option<&VolumeContentSource>,
) -> Result<Option<ContentSource>, Status> {
    let Some(source) = source else {
        return Ok(None);
    };
    match &source.r#type {
        Some(volume_content_source::Type::Snapshot(snapshot)) => {
            if snapshot.snapshot_id.is_empty() {
                return Err(Status::invalid_argument("snapshot source id must be set"));
            }
            Ok(Some(ContentSource::Snapshot(snapshot.snapshot_id.clone())))
        }
        Some(volume_content_source::Type::Volume(volume)) => {
            if volume.volume_id.is_empty() {
                return Err(Status::invalid_argument("volume source id must be set"));
            }
            Ok(Some(ContentSource::Volume(volume.volume_id.clone())))
        }
        None => Err(Status::invalid_argument(
            "volume content source must name a snapshot or a volume",
        )),
    }
}

#[tonic::async_trait]
impl Controller for ControllerService {
    #[instrument(skip(self, request))]
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.name.is_empty() {
            return Err(Status::invalid_argument("volume name must be set"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument(
                "volume capabilities must be provided",
            ));
        }
        for cap in &req.volume_capabilities {
            if cap.access_type.is_none() {
                return Err(Status::invalid_argument("an access type must be specified"));
            }
        }

        let size_bytes = requested_size(req.capacity_range.as_ref())?;
        let source = content_source(req.volume_content_source.as_ref())?;

        let params = CreateVolumeParams {
            name: req.name,
            size_bytes,
            parameters: req.parameters,
            secrets: req.secrets,
            content_source: source,
        };
        let created = self
            .volumes
            .create_volume(&params)
            .await
            .map_err(status_from)?;

        Ok(Response::new(CreateVolumeResponse {
            volume: Some(Volume {
                volume_id: created.volume_id,
                capacity_bytes: created.size_bytes as i64,
                volume_context: created.volume_context,
                content_source: params.content_source.as_ref().map(|s| VolumeContentSource {
                    r#type: Some(match s {
                        ContentSource::Snapshot(id) => volume_content_source::Type::Snapshot(
                            volume_content_source::SnapshotSource {
                                snapshot_id: id.clone(),
                            },
                        ),
                        ContentSource::Volume(id) => volume_content_source::Type::Volume(
                            volume_content_source::VolumeSource {
                                volume_id: id.clone(),
                            },
                        ),
                    }),
                }),
                accessible_topology: Vec::new(),
            }),
        }))
    }

    #[instrument(skip(self, request))]
    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume id must be set"));
        }
        self.volumes
            .delete_volume(&req.volume_id, &req.secrets)
            .await
            .map_err(status_from)?;
        Ok(Response::new(DeleteVolumeResponse {}))
    }

    async fn controller_publish_volume(
        &self,
        request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() || req.node_id.is_empty() {
            return Err(Status::invalid_argument("volume id and node id must be set"));
        }
        // Attachment happens node-side; publishing only vets the handle.
        CsiIdentifier::decode(&req.volume_id).map_err(status_from)?;
        Ok(Response::new(ControllerPublishVolumeResponse {
            publish_context: Default::default(),
        }))
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume id must be set"));
        }
        Ok(Response::new(ControllerUnpublishVolumeResponse {}))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume id must be set"));
        }
        CsiIdentifier::decode(&req.volume_id).map_err(status_from)?;

        for cap in &req.volume_capabilities {
            if cap.access_type.is_none() {
                return Err(Status::invalid_argument("an access type must be specified"));
            }
        }
        Ok(Response::new(ValidateVolumeCapabilitiesResponse {
            confirmed: Some(
                cephcsi_proto::csi::validate_volume_capabilities_response::Confirmed {
                    volume_context: req.volume_context,
                    volume_capabilities: req.volume_capabilities,
                    parameters: req.parameters,
                },
            ),
            message: String::new(),
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        let rpcs = [
            controller_service_capability::rpc::Type::CreateDeleteVolume,
            controller_service_capability::rpc::Type::PublishUnpublishVolume,
            controller_service_capability::rpc::Type::CreateDeleteSnapshot,
            controller_service_capability::rpc::Type::CloneVolume,
            controller_service_capability::rpc::Type::ExpandVolume,
        ];
        Ok(Response::new(ControllerGetCapabilitiesResponse {
            capabilities: rpcs
                .into_iter()
                .map(|rpc| ControllerServiceCapability {
                    r#type: Some(controller_service_capability::Type::Rpc(
                        controller_service_capability::Rpc { r#type: rpc as i32 },
                    )),
                })
                .collect(),
        }))
    }

    #[instrument(skip(self, request))]
    async fn create_snapshot(
        &self,
        request: Request<CreateSnapshotRequest>,
    ) -> Result<Response<CreateSnapshotResponse>, Status> {
        let req = request.into_inner();
        if req.name.is_empty() {
            return Err(Status::invalid_argument("snapshot name must be set"));
        }
        if req.source_volume_id.is_empty() {
            return Err(Status::invalid_argument("source volume id must be set"));
        }

        let params = CreateSnapshotParams {
            name: req.name,
            source_volume_id: req.source_volume_id,
            parameters: req.parameters,
            secrets: req.secrets,
        };
        let snapshot = self
            .snapshots
            .create_snapshot(&params)
            .await
            .map_err(status_from)?;

        Ok(Response::new(CreateSnapshotResponse {
            snapshot: Some(Snapshot {
                snapshot_id: snapshot.snapshot_id,
                source_volume_id: snapshot.source_volume_id,
                size_bytes: snapshot.size_bytes as i64,
                creation_time: snapshot.created_at.map(timestamp),
                ready_to_use: snapshot.ready,
                group_snapshot_id: String::new(),
            }),
        }))
    }

    #[instrument(skip(self, request))]
    async fn delete_snapshot(
        &self,
        request: Request<DeleteSnapshotRequest>,
    ) -> Result<Response<DeleteSnapshotResponse>, Status> {
        let req = request.into_inner();
        if req.snapshot_id.is_empty() {
            return Err(Status::invalid_argument("snapshot id must be set"));
        }
        self.snapshots
            .delete_snapshot(&req.snapshot_id, &req.secrets)
            .await
            .map_err(status_from)?;
        Ok(Response::new(DeleteSnapshotResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn controller_expand_volume(
        &self,
        request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume id must be set"));
        }
        let size_bytes = requested_size(req.capacity_range.as_ref())?;
        let capacity = self
            .volumes
            .expand_volume(&req.volume_id, size_bytes, &req.secrets)
            .await
            .map_err(status_from)?;

        // RBD filesystems grow node-side after the image grows; CephFS
        // quotas take effect immediately.
        let node_expansion_required = matches!(self.driver_type, DriverType::Rbd);
        Ok(Response::new(ControllerExpandVolumeResponse {
            capacity_bytes: capacity as i64,
            node_expansion_required,
        }))
    }
}
