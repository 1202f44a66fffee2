//! Configuration management for the driver daemon.
//!
//! The daemon's own settings live in a YAML file with CLI overrides; the
//! cluster map it points at stays JSON and is owned by the engine's
//! registry.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::cli::Args;

/// Storage path served by a daemon instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverType {
    Rbd,
    CephFs,
}

/// Which backend implementation to wire in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendSelection {
    /// Shell out to the Ceph CLIs.
    Cli,
    /// In-memory mock, for development and tests.
    Mock,
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Driver identity and feature toggles
    pub driver: DriverConfig,
    /// gRPC server configuration
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            driver: DriverConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config =
            serde_yaml::from_str(&content).with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Result<Self> {
        if let Some(ref endpoint) = args.endpoint {
            self.server.endpoint = endpoint.clone();
        }

        if let Some(ref cluster_map) = args.cluster_map {
            self.driver.cluster_map = cluster_map.clone();
        }

        if let Some(ref instance_id) = args.instance_id {
            self.driver.instance_id = instance_id.clone();
        }

        if let Some(ref node_id) = args.node_id {
            self.driver.node_id = Some(node_id.clone());
        }

        if let Some(ref driver_type) = args.driver_type {
            self.driver.driver_type = match driver_type.as_str() {
                "rbd" => DriverType::Rbd,
                "cephfs" => DriverType::CephFs,
                other => {
                    return Err(anyhow::anyhow!(
                        "unknown driver type {other:?}, expected rbd or cephfs"
                    ))
                }
            };
        }

        if args.dev {
            self.driver.backend = BackendSelection::Mock;
        }

        Ok(self)
    }
}

/// Driver identity and feature toggles.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Name announced to the orchestrator (domain-name notation)
    pub name: Option<String>,
    /// Storage path: rbd or cephfs
    pub driver_type: DriverType,
    /// Per-instance suffix on journal object names
    pub instance_id: String,
    /// Node id (hostname if not set)
    pub node_id: Option<String>,
    /// Path to the JSON cluster map file
    pub cluster_map: String,
    /// Backend implementation
    pub backend: BackendSelection,
    /// Serve the controller (provisioning) services
    pub enable_controller: bool,
    /// Serve the node (mount) service
    pub enable_node: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            name: None,
            driver_type: DriverType::Rbd,
            instance_id: "default".to_string(),
            node_id: None,
            cluster_map: "/etc/ceph-csi/config.json".to_string(),
            backend: BackendSelection::Cli,
            enable_controller: true,
            enable_node: true,
        }
    }
}

impl DriverConfig {
    /// The announced driver name, defaulted per driver type.
    pub fn driver_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            match self.driver_type {
                DriverType::Rbd => "rbd.csi.ceph.com",
                DriverType::CephFs => "cephfs.csi.ceph.com",
            }
            .to_string()
        })
    }

    /// Get the node id, detecting the hostname if not set.
    pub fn get_node_id(&self) -> String {
        self.node_id.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        })
    }
}

/// gRPC server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// CSI endpoint, unix:///path/to.sock or host:port
    pub endpoint: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: "unix:///var/lib/kubelet/plugins/cephcsi/csi.sock".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.driver.driver_type, DriverType::Rbd);
        assert_eq!(config.driver.driver_name(), "rbd.csi.ceph.com");
        assert_eq!(config.driver.instance_id, "default");
        assert!(config.server.endpoint.starts_with("unix://"));
    }

    #[test]
    fn test_load_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "driver:\n  driver_type: cephfs\n  instance_id: site-a\nserver:\n  endpoint: unix:///tmp/csi.sock\n"
        )
        .unwrap();
        file.flush().unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.driver.driver_type, DriverType::CephFs);
        assert_eq!(config.driver.driver_name(), "cephfs.csi.ceph.com");
        assert_eq!(config.driver.instance_id, "site-a");
        assert_eq!(config.server.endpoint, "unix:///tmp/csi.sock");
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from([
            "cephcsi-driver",
            "--endpoint",
            "127.0.0.1:9090",
            "--driver-type",
            "cephfs",
            "--instance-id",
            "site-b",
            "--dev",
        ]);
        let config = Config::default().with_cli_overrides(&args).unwrap();
        assert_eq!(config.server.endpoint, "127.0.0.1:9090");
        assert_eq!(config.driver.driver_type, DriverType::CephFs);
        assert_eq!(config.driver.instance_id, "site-b");
        assert_eq!(config.driver.backend, BackendSelection::Mock);
    }

    #[test]
    fn test_bad_driver_type_rejected() {
        let args = Args::parse_from(["cephcsi-driver", "--driver-type", "nfs"]);
        assert!(Config::default().with_cli_overrides(&args).is_err());
    }
}
