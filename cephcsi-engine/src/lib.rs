//! # cephcsi Engine
//!
//! The volume lifecycle engine of the cephcsi driver: the idempotent,
//! crash-safe mapping between orchestrator identifiers and backend Ceph
//! objects, the in-process concurrency control, and the reference-counted
//! metadata journal persisted in Ceph itself.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │            VolumeManager / SnapshotManager / GroupManager        │
//! │  - Check -> Reserve -> provision -> commit, undo on failure      │
//! └──────┬──────────────┬──────────────┬──────────────┬─────────────┘
//!        ▼              ▼              ▼              ▼
//! ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐
//! │  Journal  │  │ RefTracker│  │   Locks   │  │  Backends │
//! └─────┬─────┘  └─────┬─────┘  └───────────┘  │ (rbd/fs)  │
//!       ▼              ▼                       └───────────┘
//! ┌─────────────────────────┐
//! │  RadosCluster/RadosIoCtx│  (memory, CLI)
//! └─────────────────────────┘
//! ```
//!
//! Connections, credentials and the cluster registry feed every layer;
//! none of the layers owns a Ceph client of its own.

pub mod backend;
pub mod credentials;
pub mod error;
pub mod groups;
pub mod identifier;
pub mod journal;
pub mod locks;
pub mod mount;
pub mod rados;
pub mod reftracker;
pub mod registry;
pub mod volumes;

pub use backend::{CephFsCliBackend, MockBackend, RbdCliBackend};
pub use credentials::Credentials;
pub use error::{EngineError, Result};
pub use groups::{GroupManager, GroupSnapshotResult};
pub use identifier::CsiIdentifier;
pub use journal::Journal;
pub use locks::{OperationLocks, VolumeLocks};
pub use rados::{CliCluster, ConnectionPool, MemoryCluster};
pub use reftracker::{RefTracker, RefType};
pub use registry::{ClusterInfo, ClusterRegistry};
pub use volumes::{
    Backends, ContentSource, CreateSnapshotParams, CreateVolumeParams, CreatedVolume,
    EngineContext, SnapshotInfo, SnapshotManager, VolumeManager,
};
