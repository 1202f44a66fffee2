//! Key-based persistent reference counter.
//!
//! Backing resources shared by independent requesters (clone sources,
//! restored snapshots) are guarded by one RADOS object per resource: the
//! object data holds a 32-bit big-endian refcount, the OMap holds one entry
//! per reference key, and a version xattr supports schema evolution.
//!
//! The refcount always equals the number of `Normal` entries. `Mask`
//! entries count nothing but permanently suppress re-addition of their key,
//! which keeps a late retry of an already-rolled-back operation from
//! resurrecting a reference. Every mutation is a single write-op with a
//! generation assertion; concurrent writers see `ObjectOutOfDate` and
//! retry from a fresh snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::rados::{RadosIoCtx, StoreOp};

/// Schema version xattr on every tracker object.
pub const VERSION_XATTR: &str = "rbd.csi.ceph.com/version";
const CURRENT_VERSION: &[u8] = b"1";

const MAX_CAS_ATTEMPTS: usize = 5;

/// State of one reference key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefType {
    /// Counted reference.
    Normal,
    /// Uncounted tombstone; the key can never become `Normal` again.
    Mask,
}

impl RefType {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            RefType::Normal => b"normal",
            RefType::Mask => b"mask",
        }
    }

    fn parse(bytes: &[u8]) -> Result<Self> {
        match bytes {
            b"normal" => Ok(RefType::Normal),
            b"mask" => Ok(RefType::Mask),
            other => Err(EngineError::StateInconsistent(format!(
                "unknown reference entry type {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

/// Point-in-time view of a tracker object, pinned by its generation.
#[derive(Debug, Clone)]
pub struct RefSnapshot {
    pub generation: u64,
    pub refcount: u32,
    pub entries: BTreeMap<String, RefType>,
}

impl RefSnapshot {
    /// Whether any counted reference remains.
    pub fn has_references(&self) -> bool {
        self.refcount > 0
    }

    /// Keys currently in `Normal` state.
    pub fn normal_keys(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, t)| **t == RefType::Normal)
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// Outcome of a remove operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveOutcome {
    /// The refcount reached zero and the object was deleted.
    pub deleted: bool,
}

/// Handle to one tracker object.
#[derive(Debug, Clone)]
pub struct RefTracker {
    object: String,
}

impl RefTracker {
    pub fn new(object: impl Into<String>) -> Self {
        Self {
            object: object.into(),
        }
    }

    /// Tracker guarding the backing resource of a journal UUID.
    pub fn for_source(uuid: &Uuid) -> Self {
        Self::new(format!("csi.ref.{uuid}"))
    }

    pub fn object_name(&self) -> &str {
        &self.object
    }

    /// Read the current state; `None` when the object does not exist.
    pub async fn fetch(&self, ioctx: &Arc<dyn RadosIoCtx>) -> Result<Option<RefSnapshot>> {
        let stat = match ioctx.stat(&self.object).await? {
            Some(stat) => stat,
            None => return Ok(None),
        };

        let data = ioctx.read(&self.object).await?;
        if data.len() < 4 {
            return Err(EngineError::StateInconsistent(format!(
                "tracker object {} holds a truncated refcount",
                self.object
            )));
        }
        let refcount = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);

        let mut entries = BTreeMap::new();
        for (key, value) in ioctx.list_omap(&self.object, "").await? {
            entries.insert(key, RefType::parse(&value)?);
        }

        let normal = entries.values().filter(|t| **t == RefType::Normal).count() as u32;
        if normal != refcount {
            return Err(EngineError::StateInconsistent(format!(
                "tracker object {}: refcount {refcount} disagrees with {normal} normal entries",
                self.object
            )));
        }

        Ok(Some(RefSnapshot {
            generation: stat.generation,
            refcount,
            entries,
        }))
    }

    /// Create the object exclusively with all keys counted.
    pub async fn init(&self, ioctx: &Arc<dyn RadosIoCtx>, keys: &[&str]) -> Result<()> {
        let refcount = keys.len() as u32;
        let entries: BTreeMap<String, Vec<u8>> = keys
            .iter()
            .map(|k| (k.to_string(), RefType::Normal.as_bytes().to_vec()))
            .collect();

        ioctx
            .apply(
                &self.object,
                None,
                vec![
                    StoreOp::CreateExclusive,
                    StoreOp::WriteFull(refcount.to_be_bytes().to_vec()),
                    StoreOp::SetXattr {
                        name: VERSION_XATTR.to_string(),
                        value: CURRENT_VERSION.to_vec(),
                    },
                    StoreOp::SetOmap(entries),
                ],
            )
            .await?;
        debug!(object = %self.object, refcount = refcount, "Reference tracker initialized");
        Ok(())
    }

    /// Add keys against a fetched snapshot. Keys already present, in either
    /// state, are no-ops. Fails with `ObjectOutOfDate` if the object moved
    /// since the snapshot.
    pub async fn add(
        &self,
        ioctx: &Arc<dyn RadosIoCtx>,
        snapshot: &RefSnapshot,
        keys: &[&str],
    ) -> Result<()> {
        let new_keys: Vec<&str> = keys
            .iter()
            .filter(|k| !snapshot.entries.contains_key(**k))
            .copied()
            .collect();
        if new_keys.is_empty() {
            return Ok(());
        }

        let refcount = snapshot.refcount + new_keys.len() as u32;
        let entries: BTreeMap<String, Vec<u8>> = new_keys
            .iter()
            .map(|k| (k.to_string(), RefType::Normal.as_bytes().to_vec()))
            .collect();

        ioctx
            .apply(
                &self.object,
                Some(snapshot.generation),
                vec![
                    StoreOp::WriteFull(refcount.to_be_bytes().to_vec()),
                    StoreOp::SetOmap(entries),
                ],
            )
            .await
    }

    /// Remove keys against a fetched snapshot.
    ///
    /// Per requested key:
    /// - present `Normal`, requested `Normal`: dropped and decremented;
    /// - present `Normal`, requested `Mask`: rewritten to `Mask` and
    ///   decremented;
    /// - present `Mask`: untouched;
    /// - absent, requested `Mask`: inserted as `Mask`;
    /// - absent, requested `Normal`: no-op.
    ///
    /// When the resulting refcount is zero the whole object is deleted in
    /// the same write-op.
    pub async fn remove(
        &self,
        ioctx: &Arc<dyn RadosIoCtx>,
        snapshot: &RefSnapshot,
        requests: &BTreeMap<String, RefType>,
    ) -> Result<RemoveOutcome> {
        let mut refcount = snapshot.refcount;
        let mut dropped: Vec<String> = Vec::new();
        let mut masked: BTreeMap<String, Vec<u8>> = BTreeMap::new();

        for (key, requested) in requests {
            match (snapshot.entries.get(key), requested) {
                (Some(RefType::Normal), RefType::Normal) => {
                    dropped.push(key.clone());
                    refcount -= 1;
                }
                (Some(RefType::Normal), RefType::Mask) => {
                    masked.insert(key.clone(), RefType::Mask.as_bytes().to_vec());
                    refcount -= 1;
                }
                (Some(RefType::Mask), _) => {}
                (None, RefType::Mask) => {
                    masked.insert(key.clone(), RefType::Mask.as_bytes().to_vec());
                }
                (None, RefType::Normal) => {}
            }
        }

        if refcount == 0 {
            ioctx
                .apply(
                    &self.object,
                    Some(snapshot.generation),
                    vec![StoreOp::Remove],
                )
                .await?;
            debug!(object = %self.object, "Reference tracker drained and deleted");
            return Ok(RemoveOutcome { deleted: true });
        }

        if dropped.is_empty() && masked.is_empty() {
            return Ok(RemoveOutcome { deleted: false });
        }

        let mut ops = vec![StoreOp::WriteFull(refcount.to_be_bytes().to_vec())];
        if !masked.is_empty() {
            ops.push(StoreOp::SetOmap(masked));
        }
        if !dropped.is_empty() {
            ops.push(StoreOp::RemoveOmapKeys(dropped));
        }

        ioctx
            .apply(&self.object, Some(snapshot.generation), ops)
            .await?;
        Ok(RemoveOutcome { deleted: false })
    }

    /// Init-or-add with bounded CAS retries.
    pub async fn ensure(&self, ioctx: &Arc<dyn RadosIoCtx>, keys: &[&str]) -> Result<()> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            match self.fetch(ioctx).await? {
                None => match self.init(ioctx, keys).await {
                    Ok(()) => return Ok(()),
                    // Lost the creation race; add against the winner.
                    Err(EngineError::AlreadyExists(_)) => continue,
                    Err(e) => return Err(e),
                },
                Some(snapshot) => match self.add(ioctx, &snapshot, keys).await {
                    Ok(()) => return Ok(()),
                    Err(EngineError::ObjectOutOfDate(_)) => continue,
                    Err(e) => return Err(e),
                },
            }
        }
        Err(EngineError::ObjectOutOfDate(format!(
            "tracker object {} kept moving during {MAX_CAS_ATTEMPTS} attempts",
            self.object
        )))
    }

    /// Remove with bounded CAS retries. A missing object reports
    /// `deleted = true`.
    pub async fn release(
        &self,
        ioctx: &Arc<dyn RadosIoCtx>,
        requests: &BTreeMap<String, RefType>,
    ) -> Result<RemoveOutcome> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            match self.fetch(ioctx).await? {
                None => return Ok(RemoveOutcome { deleted: true }),
                Some(snapshot) => match self.remove(ioctx, &snapshot, requests).await {
                    Ok(outcome) => return Ok(outcome),
                    Err(EngineError::ObjectOutOfDate(_)) => continue,
                    Err(e) => return Err(e),
                },
            }
        }
        Err(EngineError::ObjectOutOfDate(format!(
            "tracker object {} kept moving during {MAX_CAS_ATTEMPTS} attempts",
            self.object
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rados::{MemoryCluster, RadosCluster};

    async fn ioctx(cluster: &MemoryCluster) -> Arc<dyn RadosIoCtx> {
        cluster.io_ctx("rbd", "").await.unwrap()
    }

    fn requests(entries: &[(&str, RefType)]) -> BTreeMap<String, RefType> {
        entries
            .iter()
            .map(|(k, t)| (k.to_string(), *t))
            .collect()
    }

    #[tokio::test]
    async fn test_full_lifecycle_sequence() {
        let cluster = MemoryCluster::new();
        let io = ioctx(&cluster).await;
        let tracker = RefTracker::new("csi.ref.test");

        // Init {a, b} -> refcount 2.
        tracker.init(&io, &["a", "b"]).await.unwrap();
        let snap = tracker.fetch(&io).await.unwrap().unwrap();
        assert_eq!(snap.refcount, 2);

        // Add {b, c} -> refcount 3; b is a no-op.
        tracker.add(&io, &snap, &["b", "c"]).await.unwrap();
        let snap = tracker.fetch(&io).await.unwrap().unwrap();
        assert_eq!(snap.refcount, 3);
        assert_eq!(snap.entries.get("a"), Some(&RefType::Normal));
        assert_eq!(snap.entries.get("b"), Some(&RefType::Normal));
        assert_eq!(snap.entries.get("c"), Some(&RefType::Normal));

        // Remove {b: Mask, c: Normal} -> refcount 1, {a: N, b: Mask}.
        let outcome = tracker
            .remove(
                &io,
                &snap,
                &requests(&[("b", RefType::Mask), ("c", RefType::Normal)]),
            )
            .await
            .unwrap();
        assert!(!outcome.deleted);
        let snap = tracker.fetch(&io).await.unwrap().unwrap();
        assert_eq!(snap.refcount, 1);
        assert_eq!(snap.entries.get("a"), Some(&RefType::Normal));
        assert_eq!(snap.entries.get("b"), Some(&RefType::Mask));
        assert!(!snap.entries.contains_key("c"));

        // Add {b, c} -> refcount 2; b stays masked.
        tracker.add(&io, &snap, &["b", "c"]).await.unwrap();
        let snap = tracker.fetch(&io).await.unwrap().unwrap();
        assert_eq!(snap.refcount, 2);
        assert_eq!(snap.entries.get("b"), Some(&RefType::Mask));
        assert_eq!(snap.entries.get("c"), Some(&RefType::Normal));

        // Remove {a: Normal, c: Normal} -> object deleted.
        let outcome = tracker
            .remove(
                &io,
                &snap,
                &requests(&[("a", RefType::Normal), ("c", RefType::Normal)]),
            )
            .await
            .unwrap();
        assert!(outcome.deleted);
        assert!(tracker.fetch(&io).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refcount_matches_normal_entries() {
        let cluster = MemoryCluster::new();
        let io = ioctx(&cluster).await;
        let tracker = RefTracker::new("csi.ref.test");

        tracker.init(&io, &["k1", "k2", "k3"]).await.unwrap();
        let mut snap = tracker.fetch(&io).await.unwrap().unwrap();

        for key in ["k1", "k2"] {
            tracker
                .remove(&io, &snap, &requests(&[(key, RefType::Mask)]))
                .await
                .unwrap();
            snap = tracker.fetch(&io).await.unwrap().unwrap();
            let normals = snap
                .entries
                .values()
                .filter(|t| **t == RefType::Normal)
                .count() as u32;
            assert_eq!(snap.refcount, normals);
        }
    }

    #[tokio::test]
    async fn test_mask_before_add_suppresses_key() {
        let cluster = MemoryCluster::new();
        let io = ioctx(&cluster).await;
        let tracker = RefTracker::new("csi.ref.test");

        tracker.init(&io, &["anchor"]).await.unwrap();
        let snap = tracker.fetch(&io).await.unwrap().unwrap();

        // Mask a key that was never added.
        tracker
            .remove(&io, &snap, &requests(&[("late", RefType::Mask)]))
            .await
            .unwrap();

        // The late add must not count it.
        let snap = tracker.fetch(&io).await.unwrap().unwrap();
        tracker.add(&io, &snap, &["late"]).await.unwrap();
        let snap = tracker.fetch(&io).await.unwrap().unwrap();
        assert_eq!(snap.refcount, 1);
        assert_eq!(snap.entries.get("late"), Some(&RefType::Mask));
    }

    #[tokio::test]
    async fn test_stale_snapshot_is_rejected() {
        let cluster = MemoryCluster::new();
        let io = ioctx(&cluster).await;
        let tracker = RefTracker::new("csi.ref.test");

        tracker.init(&io, &["a"]).await.unwrap();
        let stale = tracker.fetch(&io).await.unwrap().unwrap();

        // Another writer advances the object.
        tracker.add(&io, &stale, &["b"]).await.unwrap();

        let err = tracker.add(&io, &stale, &["c"]).await.unwrap_err();
        assert!(matches!(err, EngineError::ObjectOutOfDate(_)));
        let err = tracker
            .remove(&io, &stale, &requests(&[("a", RefType::Normal)]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ObjectOutOfDate(_)));
    }

    #[tokio::test]
    async fn test_ensure_and_release_retry_loops() {
        let cluster = MemoryCluster::new();
        let io = ioctx(&cluster).await;
        let tracker = RefTracker::new("csi.ref.test");

        // ensure initializes, then extends.
        tracker.ensure(&io, &["a"]).await.unwrap();
        tracker.ensure(&io, &["a", "b"]).await.unwrap();
        let snap = tracker.fetch(&io).await.unwrap().unwrap();
        assert_eq!(snap.refcount, 2);

        // release drains to deletion; releasing again stays deleted.
        let outcome = tracker
            .release(
                &io,
                &requests(&[("a", RefType::Normal), ("b", RefType::Normal)]),
            )
            .await
            .unwrap();
        assert!(outcome.deleted);
        let outcome = tracker
            .release(&io, &requests(&[("a", RefType::Normal)]))
            .await
            .unwrap();
        assert!(outcome.deleted);
    }

    #[tokio::test]
    async fn test_version_xattr_is_stamped() {
        let cluster = MemoryCluster::new();
        let io = ioctx(&cluster).await;
        let tracker = RefTracker::new("csi.ref.test");

        tracker.init(&io, &["a"]).await.unwrap();
        let version = io
            .get_xattr("csi.ref.test", VERSION_XATTR)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(version, b"1");
    }
}
