//! Command-line argument parsing.

use clap::Parser;

/// cephcsi Driver - Ceph CSI provisioning daemon
#[derive(Parser, Debug)]
#[command(name = "cephcsi-driver")]
#[command(about = "cephcsi Driver - Ceph CSI provisioning daemon")]
#[command(version)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/ceph-csi/driver.yaml")]
    pub config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit JSON logs instead of console logs
    #[arg(long)]
    pub log_json: bool,

    /// CSI endpoint, unix:///path/to.sock or host:port
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Path to the JSON cluster map file
    #[arg(long)]
    pub cluster_map: Option<String>,

    /// Unique id of this driver instance within shared clusters
    #[arg(long)]
    pub instance_id: Option<String>,

    /// Node id reported to the orchestrator (hostname if not set)
    #[arg(long)]
    pub node_id: Option<String>,

    /// Storage path served by this daemon: rbd or cephfs
    #[arg(long)]
    pub driver_type: Option<String>,

    /// Enable development mode (mock backend, no cluster required)
    #[arg(long)]
    pub dev: bool,
}
