//! In-memory RADOS cluster for testing and development.
//!
//! Simulates the object store without a Ceph cluster: objects carry data,
//! an OMap, xattrs and a generation, and `apply` is atomic under one lock,
//! matching the partial-application-free guarantee of a real write-op.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{EngineError, Result};

use super::{ObjectStat, RadosCluster, RadosIoCtx, StoreOp};

#[derive(Debug, Clone, Default)]
struct MemObject {
    data: Vec<u8>,
    omap: BTreeMap<String, Vec<u8>>,
    xattrs: BTreeMap<String, Vec<u8>>,
    generation: u64,
}

type ObjectKey = (String, String, String);

#[derive(Default)]
struct State {
    pool_ids: HashMap<String, i64>,
    next_pool_id: i64,
    objects: HashMap<ObjectKey, MemObject>,
}

/// In-memory cluster; cheap to clone via `Arc`.
pub struct MemoryCluster {
    state: Arc<Mutex<State>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                pool_ids: HashMap::new(),
                next_pool_id: 1,
                objects: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Test helper: whether an object exists.
    pub fn object_exists(&self, pool: &str, namespace: &str, oid: &str) -> bool {
        self.lock()
            .objects
            .contains_key(&key(pool, namespace, oid))
    }

    /// Test helper: object names in a pool/namespace with a given prefix.
    pub fn objects_with_prefix(&self, pool: &str, namespace: &str, prefix: &str) -> Vec<String> {
        self.lock()
            .objects
            .keys()
            .filter(|(p, n, o)| p == pool && n == namespace && o.starts_with(prefix))
            .map(|(_, _, o)| o.clone())
            .collect()
    }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn key(pool: &str, namespace: &str, oid: &str) -> ObjectKey {
    (pool.to_string(), namespace.to_string(), oid.to_string())
}

#[async_trait]
impl RadosCluster for MemoryCluster {
    async fn io_ctx(&self, pool: &str, namespace: &str) -> Result<Arc<dyn RadosIoCtx>> {
        // Pools spring into existence on first use; tests do not manage
        // cluster topology.
        let _ = self.pool_id(pool).await?;
        Ok(Arc::new(MemoryIoCtx {
            state: self.state.clone(),
            pool: pool.to_string(),
            namespace: namespace.to_string(),
        }))
    }

    async fn pool_id(&self, pool: &str) -> Result<i64> {
        let mut state = self.lock();
        if let Some(id) = state.pool_ids.get(pool) {
            return Ok(*id);
        }
        let id = state.next_pool_id;
        state.next_pool_id += 1;
        state.pool_ids.insert(pool.to_string(), id);
        Ok(id)
    }

    async fn pool_name(&self, pool_id: i64) -> Result<String> {
        self.lock()
            .pool_ids
            .iter()
            .find(|(_, id)| **id == pool_id)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| EngineError::NotFound(format!("no pool with id {pool_id}")))
    }
}

struct MemoryIoCtx {
    state: Arc<Mutex<State>>,
    pool: String,
    namespace: String,
}

impl MemoryIoCtx {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn key(&self, oid: &str) -> ObjectKey {
        key(&self.pool, &self.namespace, oid)
    }
}

#[async_trait]
impl RadosIoCtx for MemoryIoCtx {
    fn pool(&self) -> &str {
        &self.pool
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn stat(&self, oid: &str) -> Result<Option<ObjectStat>> {
        Ok(self.lock().objects.get(&self.key(oid)).map(|o| ObjectStat {
            size: o.data.len() as u64,
            generation: o.generation,
        }))
    }

    async fn read(&self, oid: &str) -> Result<Vec<u8>> {
        self.lock()
            .objects
            .get(&self.key(oid))
            .map(|o| o.data.clone())
            .ok_or_else(|| EngineError::NotFound(format!("object {oid} not found")))
    }

    async fn get_omap(&self, oid: &str, keys: &[&str]) -> Result<BTreeMap<String, Vec<u8>>> {
        let state = self.lock();
        let object = state
            .objects
            .get(&self.key(oid))
            .ok_or_else(|| EngineError::NotFound(format!("object {oid} not found")))?;
        Ok(keys
            .iter()
            .filter_map(|k| object.omap.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect())
    }

    async fn list_omap(&self, oid: &str, prefix: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        let state = self.lock();
        let object = state
            .objects
            .get(&self.key(oid))
            .ok_or_else(|| EngineError::NotFound(format!("object {oid} not found")))?;
        Ok(object
            .omap
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn get_xattr(&self, oid: &str, name: &str) -> Result<Option<Vec<u8>>> {
        let state = self.lock();
        let object = state
            .objects
            .get(&self.key(oid))
            .ok_or_else(|| EngineError::NotFound(format!("object {oid} not found")))?;
        Ok(object.xattrs.get(name).cloned())
    }

    async fn apply(
        &self,
        oid: &str,
        assert_generation: Option<u64>,
        ops: Vec<StoreOp>,
    ) -> Result<()> {
        let mut state = self.lock();
        let key = self.key(oid);
        let existing = state.objects.get(&key);

        if let Some(expected) = assert_generation {
            let current = existing.map(|o| o.generation).unwrap_or(0);
            if current != expected || existing.is_none() {
                return Err(EngineError::ObjectOutOfDate(format!(
                    "object {oid}: generation {current} != asserted {expected}"
                )));
            }
        }
        if existing.is_some() && ops.iter().any(|op| matches!(op, StoreOp::CreateExclusive)) {
            return Err(EngineError::AlreadyExists(format!(
                "object {oid} already exists"
            )));
        }

        // Validation passed; from here the whole batch commits.
        let mut object = existing.cloned().unwrap_or_default();
        let mut removed = false;
        for op in ops {
            match op {
                StoreOp::CreateExclusive => {}
                StoreOp::WriteFull(data) => object.data = data,
                StoreOp::SetOmap(entries) => object.omap.extend(entries),
                StoreOp::RemoveOmapKeys(keys) => {
                    for k in keys {
                        object.omap.remove(&k);
                    }
                }
                StoreOp::SetXattr { name, value } => {
                    object.xattrs.insert(name, value);
                }
                StoreOp::Remove => removed = true,
            }
        }

        if removed {
            state.objects.remove(&key);
        } else {
            object.generation += 1;
            state.objects.insert(key, object);
        }
        Ok(())
    }

    async fn remove(&self, oid: &str) -> Result<()> {
        let key = self.key(oid);
        self.lock().objects.remove(&key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn omap(entries: &[(&str, &str)]) -> BTreeMap<String, Vec<u8>> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect()
    }

    #[tokio::test]
    async fn test_create_exclusive_collides() {
        let cluster = MemoryCluster::new();
        let ioctx = cluster.io_ctx("rbd", "").await.unwrap();

        ioctx
            .apply("obj", None, vec![StoreOp::CreateExclusive])
            .await
            .unwrap();
        let err = ioctx
            .apply("obj", None, vec![StoreOp::CreateExclusive])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_apply_is_all_or_nothing() {
        let cluster = MemoryCluster::new();
        let ioctx = cluster.io_ctx("rbd", "").await.unwrap();

        ioctx
            .apply("obj", None, vec![StoreOp::SetOmap(omap(&[("a", "1")]))])
            .await
            .unwrap();

        // A failing batch (exclusive create on an existing object) must not
        // apply its other ops.
        let err = ioctx
            .apply(
                "obj",
                None,
                vec![
                    StoreOp::SetOmap(omap(&[("b", "2")])),
                    StoreOp::CreateExclusive,
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyExists(_)));
        let entries = ioctx.get_omap("obj", &["a", "b"]).await.unwrap();
        assert!(entries.contains_key("a"));
        assert!(!entries.contains_key("b"));
    }

    #[tokio::test]
    async fn test_generation_cas() {
        let cluster = MemoryCluster::new();
        let ioctx = cluster.io_ctx("rbd", "").await.unwrap();

        ioctx
            .apply("obj", None, vec![StoreOp::WriteFull(vec![1])])
            .await
            .unwrap();
        let gen1 = ioctx.stat("obj").await.unwrap().unwrap().generation;

        ioctx
            .apply("obj", Some(gen1), vec![StoreOp::WriteFull(vec![2])])
            .await
            .unwrap();
        let gen2 = ioctx.stat("obj").await.unwrap().unwrap().generation;
        assert!(gen2 > gen1);

        // A stale assertion fails and applies nothing.
        let err = ioctx
            .apply("obj", Some(gen1), vec![StoreOp::WriteFull(vec![3])])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ObjectOutOfDate(_)));
        assert_eq!(ioctx.read("obj").await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_remove_in_batch_deletes_object() {
        let cluster = MemoryCluster::new();
        let ioctx = cluster.io_ctx("rbd", "").await.unwrap();

        ioctx
            .apply("obj", None, vec![StoreOp::SetOmap(omap(&[("a", "1")]))])
            .await
            .unwrap();
        let generation = ioctx.stat("obj").await.unwrap().unwrap().generation;
        ioctx
            .apply(
                "obj",
                Some(generation),
                vec![StoreOp::RemoveOmapKeys(vec!["a".to_string()]), StoreOp::Remove],
            )
            .await
            .unwrap();
        assert!(ioctx.stat("obj").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_namespaces_are_disjoint() {
        let cluster = MemoryCluster::new();
        let a = cluster.io_ctx("rbd", "tenant-a").await.unwrap();
        let b = cluster.io_ctx("rbd", "tenant-b").await.unwrap();

        a.apply("obj", None, vec![StoreOp::WriteFull(vec![1])])
            .await
            .unwrap();
        assert!(b.stat("obj").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pool_ids_round_trip() {
        let cluster = MemoryCluster::new();
        let id = cluster.pool_id("rbd").await.unwrap();
        assert_eq!(cluster.pool_id("rbd").await.unwrap(), id);
        assert_eq!(cluster.pool_name(id).await.unwrap(), "rbd");
        assert_ne!(cluster.pool_id("other").await.unwrap(), id);
    }
}
