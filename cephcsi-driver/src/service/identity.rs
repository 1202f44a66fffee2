//! CSI Identity service implementation.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::debug;

use cephcsi_engine::ClusterRegistry;
use cephcsi_proto::csi::{
    plugin_capability, GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse,
    GetPluginInfoRequest, GetPluginInfoResponse, Identity, PluginCapability, ProbeRequest,
    ProbeResponse,
};

/// Identity service: plugin discovery and readiness.
pub struct IdentityService {
    driver_name: String,
    registry: Arc<ClusterRegistry>,
    serves_controller: bool,
}

impl IdentityService {
    pub fn new(driver_name: String, registry: Arc<ClusterRegistry>, serves_controller: bool) -> Self {
        Self {
            driver_name,
            registry,
            serves_controller,
        }
    }
}

#[tonic::async_trait]
impl Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        Ok(Response::new(GetPluginInfoResponse {
            name: self.driver_name.clone(),
            vendor_version: env!("CARGO_PKG_VERSION").to_string(),
            ..Default::default()
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        let mut capabilities = vec![PluginCapability {
            r#type: Some(plugin_capability::Type::VolumeExpansion(
                plugin_capability::VolumeExpansion {
                    r#type: plugin_capability::volume_expansion::Type::Online as i32,
                },
            )),
        }];
        if self.serves_controller {
            capabilities.push(PluginCapability {
                r#type: Some(plugin_capability::Type::Service(
                    plugin_capability::Service {
                        r#type: plugin_capability::service::Type::ControllerService as i32,
                    },
                )),
            });
            capabilities.push(PluginCapability {
                r#type: Some(plugin_capability::Type::Service(
                    plugin_capability::Service {
                        r#type: plugin_capability::service::Type::GroupControllerService as i32,
                    },
                )),
            });
        }
        Ok(Response::new(GetPluginCapabilitiesResponse { capabilities }))
    }

    async fn probe(&self, _request: Request<ProbeRequest>) -> Result<Response<ProbeResponse>, Status> {
        // Ready once the cluster map parses; a malformed map would fail
        // every provisioning call anyway.
        let ready = self.registry.healthy();
        debug!(ready = ready, "Probe");
        Ok(Response::new(ProbeResponse { ready: Some(ready) }))
    }
}
