//! CSI Node service implementation.
//!
//! Thin delegation to the mount collaborators: stage attaches the backing
//! resource to the node (map + mount for RBD, CephFS mount for
//! subvolumes), publish bind-mounts the staged path into the container
//! target. No filesystem formatting policy lives here.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tonic::{Request, Response, Status};
use tracing::{info, instrument, warn};

use cephcsi_engine::backend::CephConn;
use cephcsi_engine::mount::{self, CephFsSource, MounterType};
use cephcsi_engine::volumes::Backends;
use cephcsi_engine::{Credentials, EngineContext};
use cephcsi_proto::csi::{
    node_service_capability, volume_capability, Node, NodeExpandVolumeRequest,
    NodeExpandVolumeResponse, NodeGetCapabilitiesRequest, NodeGetCapabilitiesResponse,
    NodeGetInfoRequest, NodeGetInfoResponse, NodePublishVolumeRequest,
    NodePublishVolumeResponse, NodeServiceCapability, NodeStageVolumeRequest,
    NodeStageVolumeResponse, NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse,
    NodeUnstageVolumeRequest, NodeUnstageVolumeResponse,
};

use crate::status::status_from;

/// Node-side record of a staged RBD volume, needed to unmap at unstage
/// when the request no longer carries context or secrets.
#[derive(Debug, Serialize, Deserialize)]
struct StagingRecord {
    device: String,
}

fn staging_record_path(staging_path: &str) -> PathBuf {
    PathBuf::from(format!("{staging_path}.json"))
}

/// Node service: stage/unstage and publish/unpublish.
pub struct NodeService {
    node_id: String,
    ctx: Arc<EngineContext>,
}

impl NodeService {
    pub fn new(node_id: String, ctx: Arc<EngineContext>) -> Self {
        Self { node_id, ctx }
    }

    fn context_value<'a>(
        context: &'a std::collections::HashMap<String, String>,
        key: &str,
    ) -> Result<&'a str, Status> {
        context
            .get(key)
            .map(|v| v.as_str())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Status::invalid_argument(format!("volume context misses {key}")))
    }

    fn conn_for(
        &self,
        context: &std::collections::HashMap<String, String>,
        creds: &Credentials,
    ) -> Result<(cephcsi_engine::ClusterInfo, CephConn), Status> {
        let cluster_id = Self::context_value(context, "clusterID")?;
        let cluster = self
            .ctx
            .registry
            .lookup(cluster_id)
            .map_err(status_from)?;
        let conn = CephConn::new(&cluster, creds).map_err(status_from)?;
        Ok((cluster, conn))
    }
}

#[tonic::async_trait]
impl Node for NodeService {
    #[instrument(skip(self, request))]
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() || req.staging_target_path.is_empty() {
            return Err(Status::invalid_argument(
                "volume id and staging target path must be set",
            ));
        }
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("volume capability must be set"))?;

        let context = &req.volume_context;
        // Statically provisioned volumes bypass the journal: the handle is
        // the backend name.
        let image_name = context
            .get("imageName")
            .cloned()
            .or_else(|| {
                (context.get("staticVolume").map(|v| v.as_str()) == Some("true"))
                    .then(|| req.volume_id.clone())
            })
            .ok_or_else(|| Status::invalid_argument("volume context misses imageName"))?;

        let creds = Credentials::from_secrets(&req.secrets).map_err(status_from)?;
        let (cluster, conn) = self.conn_for(context, &creds)?;

        tokio::fs::create_dir_all(&req.staging_target_path)
            .await
            .map_err(|e| Status::internal(format!("failed to create staging path: {e}")))?;

        match &self.ctx.backends {
            Backends::Rbd(backend) => {
                let pool = Self::context_value(context, "pool")?;
                let namespace = context
                    .get("radosNamespace")
                    .cloned()
                    .unwrap_or_else(|| cluster.rados_namespace.clone());
                let map_options = context.get("mapOptions").map(|v| v.as_str());

                let device = backend
                    .map_image(&conn, pool, &namespace, &image_name, map_options)
                    .await
                    .map_err(status_from)?;

                let record = StagingRecord {
                    device: device.clone(),
                };
                let record_json = serde_json::to_vec(&record)
                    .map_err(|e| Status::internal(format!("failed to encode staging record: {e}")))?;
                tokio::fs::write(staging_record_path(&req.staging_target_path), record_json)
                    .await
                    .map_err(|e| {
                        Status::internal(format!("failed to persist staging record: {e}"))
                    })?;

                if matches!(
                    capability.access_type,
                    Some(volume_capability::AccessType::Mount(_))
                ) {
                    mount::mount_device(&device, Path::new(&req.staging_target_path), &[])
                        .await
                        .map_err(status_from)?;
                }
                info!(device = %device, "RBD volume staged");
            }
            Backends::CephFs(backend) => {
                let fs_name = Self::context_value(context, "fsName")?;
                let group = context
                    .get("subvolumeGroup")
                    .map(|v| v.as_str())
                    .unwrap_or_else(|| cluster.subvolume_group());
                let subvolume_path = backend
                    .subvolume_path(&conn, fs_name, group, &image_name)
                    .await
                    .map_err(status_from)?;

                let mounter_kind = match context.get("mounter") {
                    Some(value) => MounterType::parse(value).map_err(status_from)?,
                    None => MounterType::default(),
                };
                let option_key = match mounter_kind {
                    MounterType::Kernel => "kernelMountOptions",
                    MounterType::Fuse => "fuseMountOptions",
                };
                let options: Vec<String> = context
                    .get(option_key)
                    .map(|v| v.split(',').map(|o| o.trim().to_string()).collect())
                    .unwrap_or_default();

                let mounter = mount::mounter_for(mounter_kind);
                mounter
                    .mount(
                        &conn,
                        &CephFsSource {
                            fs_name,
                            subvolume_path: &subvolume_path,
                        },
                        Path::new(&req.staging_target_path),
                        &options,
                    )
                    .await
                    .map_err(status_from)?;
                info!(path = %subvolume_path, "CephFS volume staged");
            }
        }

        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() || req.staging_target_path.is_empty() {
            return Err(Status::invalid_argument(
                "volume id and staging target path must be set",
            ));
        }

        mount::unmount_path(Path::new(&req.staging_target_path))
            .await
            .map_err(status_from)?;

        // Unmap a staged RBD device using the record written at stage; the
        // unstage request itself carries neither context nor secrets.
        let record_path = staging_record_path(&req.staging_target_path);
        if let Ok(bytes) = tokio::fs::read(&record_path).await {
            match serde_json::from_slice::<StagingRecord>(&bytes) {
                Ok(record) => {
                    let output = tokio::process::Command::new("rbd")
                        .args(["unmap", &record.device])
                        .output()
                        .await
                        .map_err(|e| Status::internal(format!("failed to execute rbd: {e}")))?;
                    if !output.status.success() {
                        let stderr = String::from_utf8_lossy(&output.stderr);
                        warn!(device = %record.device, stderr = %stderr, "rbd unmap failed");
                    }
                }
                Err(e) => warn!(error = %e, "Unreadable staging record, skipping unmap"),
            }
            if let Err(e) = tokio::fs::remove_file(&record_path).await {
                warn!(error = %e, "Failed to remove staging record");
            }
        }

        Ok(Response::new(NodeUnstageVolumeResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() || req.target_path.is_empty() {
            return Err(Status::invalid_argument(
                "volume id and target path must be set",
            ));
        }
        if req.staging_target_path.is_empty() {
            return Err(Status::invalid_argument("staging target path must be set"));
        }

        tokio::fs::create_dir_all(&req.target_path)
            .await
            .map_err(|e| Status::internal(format!("failed to create target path: {e}")))?;
        mount::bind_mount(
            Path::new(&req.staging_target_path),
            Path::new(&req.target_path),
            req.readonly,
        )
        .await
        .map_err(status_from)?;
        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    #[instrument(skip(self, request))]
    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() || req.target_path.is_empty() {
            return Err(Status::invalid_argument(
                "volume id and target path must be set",
            ));
        }
        mount::unmount_path(Path::new(&req.target_path))
            .await
            .map_err(status_from)?;
        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: vec![NodeServiceCapability {
                r#type: Some(node_service_capability::Type::Rpc(
                    node_service_capability::Rpc {
                        r#type: node_service_capability::rpc::Type::StageUnstageVolume as i32,
                    },
                )),
            }],
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 0,
            accessible_topology: None,
        }))
    }

    async fn node_expand_volume(
        &self,
        _request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        // Filesystem resizing policy belongs to the orchestrator sidecars.
        Err(Status::unimplemented("node expansion not supported"))
    }
}
