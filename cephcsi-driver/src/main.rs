//! # cephcsi Driver
//!
//! The CSI driver daemon serves the Identity, Controller, GroupController,
//! Node and Replication services over a local endpoint and maps every
//! provisioning request onto Ceph through the lifecycle engine.
//!
//! ## Usage
//! ```bash
//! cephcsi-driver --config /etc/ceph-csi/driver.yaml
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cli;
mod config;
mod server;
mod service;
mod status;

use cli::Args;
use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    if args.log_json {
        cephcsi_common::init_logging_json(&args.log_level)?;
    } else {
        cephcsi_common::init_logging(&args.log_level)?;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting cephcsi driver"
    );

    // Load configuration
    let config = match Config::load(&args.config) {
        Ok(cfg) => {
            info!(config_path = %args.config, "Configuration loaded");
            cfg
        }
        Err(_) if args.config == "/etc/ceph-csi/driver.yaml" => {
            info!("No config file found, using defaults");
            Config::default()
        }
        Err(e) => {
            error!(error = %e, path = %args.config, "Failed to load configuration");
            return Err(e);
        }
    };

    // Override config with CLI args
    let config = config.with_cli_overrides(&args)?;

    info!(
        endpoint = %config.server.endpoint,
        driver_type = ?config.driver.driver_type,
        backend = ?config.driver.backend,
        "Driver configured"
    );

    // Start gRPC server
    if let Err(e) = server::run(config).await {
        error!(error = %e, "Server failed");
        return Err(e);
    }

    Ok(())
}
