//! gRPC server setup and lifecycle.

use anyhow::{Context as _, Result};
use std::path::Path;
use std::sync::Arc;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{info, warn};

use cephcsi_engine::rados::RadosCluster;
use cephcsi_engine::{
    locks, registry, Backends, CephFsCliBackend, ConnectionPool, EngineContext, MemoryCluster,
    MockBackend, RbdCliBackend,
};
use cephcsi_proto::csi::{ControllerServer, GroupControllerServer, IdentityServer, NodeServer};
use cephcsi_proto::replication::ReplicationServer;

use crate::config::{BackendSelection, Config, DriverType};
use crate::service::{
    ControllerService, GroupService, IdentityService, NodeService, ReplicationService,
};

/// Run the gRPC server until shutdown.
pub async fn run(config: Config) -> Result<()> {
    let registry = registry::init(&config.driver.cluster_map);
    if !registry.healthy() {
        // The daemon still starts: Probe reports unready until the map
        // appears, and the orchestrator holds off.
        warn!(
            cluster_map = %config.driver.cluster_map,
            "Cluster map is missing or malformed"
        );
    }

    // Select the backend implementation.
    let (backends, connections) = match config.driver.backend {
        BackendSelection::Mock => {
            info!("Using mock Ceph backend");
            let mock = Arc::new(MockBackend::new());
            let backends = match config.driver.driver_type {
                DriverType::Rbd => Backends::Rbd(mock),
                DriverType::CephFs => Backends::CephFs(mock),
            };
            // One in-memory cluster shared by every connection checkout,
            // so journal state survives across requests.
            let cluster = Arc::new(MemoryCluster::new());
            let connections = ConnectionPool::new(Box::new(move |_, _, _| {
                Ok(cluster.clone() as Arc<dyn RadosCluster>)
            }));
            (backends, connections)
        }
        BackendSelection::Cli => {
            let backends = match config.driver.driver_type {
                DriverType::Rbd => Backends::Rbd(Arc::new(RbdCliBackend::new())),
                DriverType::CephFs => Backends::CephFs(Arc::new(CephFsCliBackend::new())),
            };
            (backends, ConnectionPool::with_cli())
        }
    };

    let ctx = Arc::new(EngineContext {
        instance_id: config.driver.instance_id.clone(),
        registry: registry.clone(),
        connections,
        volume_locks: locks::volume_locks(),
        operation_locks: locks::operation_locks(),
        backends,
    });

    let driver_name = config.driver.driver_name();
    let node_id = config.driver.get_node_id();
    info!(
        driver = %driver_name,
        node_id = %node_id,
        instance_id = %config.driver.instance_id,
        controller = config.driver.enable_controller,
        node = config.driver.enable_node,
        "Starting CSI services"
    );

    let identity = IdentityService::new(
        driver_name,
        registry.clone(),
        config.driver.enable_controller,
    );

    let controller = config
        .driver
        .enable_controller
        .then(|| ControllerService::new(ctx.clone(), config.driver.driver_type));
    let group = config
        .driver
        .enable_controller
        .then(|| GroupService::new(ctx.clone()));
    let replication = (config.driver.enable_controller
        && config.driver.driver_type == DriverType::Rbd)
        .then(|| ReplicationService::new(ctx.clone()));
    let node = config
        .driver
        .enable_node
        .then(|| NodeService::new(node_id, ctx.clone()));

    let router = Server::builder()
        .add_service(IdentityServer::new(identity))
        .add_optional_service(controller.map(ControllerServer::new))
        .add_optional_service(group.map(GroupControllerServer::new))
        .add_optional_service(replication.map(ReplicationServer::new))
        .add_optional_service(node.map(NodeServer::new));

    let endpoint = config.server.endpoint.clone();
    if let Some(socket_path) = endpoint.strip_prefix("unix://") {
        let socket_path = Path::new(socket_path);
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        // A stale socket from a previous run blocks the bind.
        match tokio::fs::remove_file(socket_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to remove {}", socket_path.display()))
            }
        }

        let listener = tokio::net::UnixListener::bind(socket_path)
            .with_context(|| format!("failed to bind {}", socket_path.display()))?;
        info!(endpoint = %endpoint, "gRPC server listening");
        router
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown_signal())
            .await
            .context("gRPC server failed")?;
    } else {
        let addr = endpoint
            .parse()
            .with_context(|| format!("invalid listen address {endpoint}"))?;
        info!(endpoint = %endpoint, "gRPC server listening");
        router
            .serve_with_shutdown(addr, shutdown_signal())
            .await
            .context("gRPC server failed")?;
    }

    registry::shutdown();
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}
