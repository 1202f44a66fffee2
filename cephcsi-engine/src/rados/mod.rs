//! Minimal RADOS collaborator interface.
//!
//! The engine does not implement a Ceph client. Everything it needs from
//! RADOS is captured by two traits: a cluster handle that opens IO contexts
//! and resolves pool ids, and an IO context scoped to a pool (and optional
//! namespace) offering object reads plus one batched, all-or-nothing
//! `apply` write-operation.
//!
//! Two implementations ship here:
//! - [`MemoryCluster`]: in-memory, used by every test.
//! - [`CliCluster`]: shells out to the `rados`/`ceph` CLIs for deployments
//!   where the daemon runs next to ceph-common.

mod cli;
mod memory;
mod pool;

pub use cli::CliCluster;
pub use memory::MemoryCluster;
pub use pool::{ConnectionGuard, ConnectionPool};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// Xattr tracking the object generation used for compare-and-swap.
pub const GENERATION_XATTR: &str = "csi.generation";

/// Size and generation of a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStat {
    pub size: u64,
    /// Monotonic per-object version; bumped by every successful `apply`.
    pub generation: u64,
}

/// One step of a batched write-operation.
///
/// Mirrors the librados write-op surface: all steps of an `apply` commit
/// together or not at all.
#[derive(Debug, Clone)]
pub enum StoreOp {
    /// Create the object, failing the whole operation with `AlreadyExists`
    /// if it is already present.
    CreateExclusive,
    /// Replace the object data.
    WriteFull(Vec<u8>),
    /// Set OMap entries.
    SetOmap(BTreeMap<String, Vec<u8>>),
    /// Remove OMap entries; absent keys are tolerated.
    RemoveOmapKeys(Vec<String>),
    /// Set an extended attribute.
    SetXattr { name: String, value: Vec<u8> },
    /// Remove the whole object.
    Remove,
}

/// Handle to a pool (and optional namespace) within one cluster.
///
/// Read semantics: `stat` returns `None` for a missing object; `read`,
/// `get_omap` and `list_omap` fail with `NotFound` for a missing object;
/// absent OMap keys and xattrs are simply omitted (`None`).
///
/// Write semantics: `apply` without `CreateExclusive` creates a missing
/// object implicitly, like a RADOS write-op does. When `assert_generation`
/// is given and the object's current generation differs (or the object is
/// gone), the operation fails with `ObjectOutOfDate` and nothing is
/// applied.
#[async_trait]
pub trait RadosIoCtx: Send + Sync {
    fn pool(&self) -> &str;
    fn namespace(&self) -> &str;

    async fn stat(&self, oid: &str) -> Result<Option<ObjectStat>>;
    async fn read(&self, oid: &str) -> Result<Vec<u8>>;
    async fn get_omap(&self, oid: &str, keys: &[&str]) -> Result<BTreeMap<String, Vec<u8>>>;
    async fn list_omap(&self, oid: &str, prefix: &str) -> Result<BTreeMap<String, Vec<u8>>>;
    async fn get_xattr(&self, oid: &str, name: &str) -> Result<Option<Vec<u8>>>;

    async fn apply(
        &self,
        oid: &str,
        assert_generation: Option<u64>,
        ops: Vec<StoreOp>,
    ) -> Result<()>;

    /// Remove an object; removing a missing object succeeds.
    async fn remove(&self, oid: &str) -> Result<()>;
}

/// Live handle to one Ceph cluster.
#[async_trait]
pub trait RadosCluster: Send + Sync {
    async fn io_ctx(&self, pool: &str, namespace: &str) -> Result<Arc<dyn RadosIoCtx>>;

    /// Numeric id of a pool; feeds the identifier codec's location field.
    async fn pool_id(&self, pool: &str) -> Result<i64>;

    /// Reverse of [`Self::pool_id`], used when decoding identifiers.
    async fn pool_name(&self, pool_id: i64) -> Result<String>;
}
