//! In-process mutual exclusion for volume and snapshot operations.
//!
//! The CSI contract allows one in-flight operation per volume. These lock
//! sets never block: acquisition either succeeds immediately or fails with
//! [`EngineError::Aborted`], and the orchestrator retries at its own
//! cadence. Release happens through RAII guards so every return path drops
//! the key.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::error::{EngineError, Result};

/// One lock per identifier (or request name, before an identifier exists).
#[derive(Debug, Default)]
pub struct VolumeLocks {
    held: Mutex<HashSet<String>>,
}

impl VolumeLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Non-blocking acquire. Fails with `Aborted` while any holder exists,
    /// including the caller itself.
    pub fn try_acquire(self: &Arc<Self>, key: &str) -> Result<VolumeLockGuard> {
        let mut held = self.lock();
        if !held.insert(key.to_string()) {
            return Err(EngineError::Aborted(format!(
                "an operation with the given key {key} already exists"
            )));
        }
        Ok(VolumeLockGuard {
            locks: self.clone(),
            key: key.to_string(),
        })
    }

    /// Whether the key is currently held.
    pub fn is_held(&self, key: &str) -> bool {
        self.lock().contains(key)
    }

    fn release(&self, key: &str) {
        self.lock().remove(key);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Holds a volume lock until dropped.
#[derive(Debug)]
pub struct VolumeLockGuard {
    locks: Arc<VolumeLocks>,
    key: String,
}

impl Drop for VolumeLockGuard {
    fn drop(&mut self) {
        self.locks.release(&self.key);
    }
}

/// Operation families tracked by [`OperationLocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Clone,
    Delete,
    Expand,
    Restore,
}

#[derive(Debug, Default, Clone)]
struct OpCounts {
    clones: usize,
    deletes: usize,
    expands: usize,
    restores: usize,
}

impl OpCounts {
    fn count_mut(&mut self, op: Operation) -> &mut usize {
        match op {
            Operation::Clone => &mut self.clones,
            Operation::Delete => &mut self.deletes,
            Operation::Expand => &mut self.expands,
            Operation::Restore => &mut self.restores,
        }
    }

    fn is_empty(&self) -> bool {
        self.clones == 0 && self.deletes == 0 && self.expands == 0 && self.restores == 0
    }
}

/// Finer-grained per-key operation tracking.
///
/// Several operations of compatible families may run against one key at a
/// time (a snapshot can serve multiple clones), but clone and delete are
/// mutually exclusive: a source must not disappear under an in-flight
/// clone, and clones must not attach to a source being deleted.
#[derive(Debug, Default)]
pub struct OperationLocks {
    held: Mutex<HashMap<String, OpCounts>>,
}

impl OperationLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Non-blocking acquire of one operation family on a key.
    pub fn try_acquire(
        self: &Arc<Self>,
        op: Operation,
        key: &str,
    ) -> Result<OperationLockGuard> {
        let mut held = self.lock();
        let current = held.get(key).cloned().unwrap_or_default();

        let conflict = match op {
            Operation::Clone | Operation::Restore if current.deletes > 0 => Some("delete"),
            Operation::Delete if current.clones > 0 => Some("clone"),
            Operation::Delete if current.restores > 0 => Some("restore"),
            _ => None,
        };
        if let Some(other) = conflict {
            return Err(EngineError::Aborted(format!(
                "{op:?} operation on {key} conflicts with an in-flight {other}"
            )));
        }

        *held.entry(key.to_string()).or_default().count_mut(op) += 1;
        Ok(OperationLockGuard {
            locks: self.clone(),
            op,
            key: key.to_string(),
        })
    }

    fn release(&self, op: Operation, key: &str) {
        let mut held = self.lock();
        if let Some(counts) = held.get_mut(key) {
            let count = counts.count_mut(op);
            *count = count.saturating_sub(1);
            if counts.is_empty() {
                held.remove(key);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, OpCounts>> {
        self.held.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Holds one operation-family slot until dropped.
#[derive(Debug)]
pub struct OperationLockGuard {
    locks: Arc<OperationLocks>,
    op: Operation,
    key: String,
}

impl Drop for OperationLockGuard {
    fn drop(&mut self) {
        self.locks.release(self.op, &self.key);
    }
}

// Process-wide lock sets shared by all services of a daemon. Tests build
// private sets instead.
static VOLUME_LOCKS: Lazy<Arc<VolumeLocks>> = Lazy::new(VolumeLocks::new);
static OPERATION_LOCKS: Lazy<Arc<OperationLocks>> = Lazy::new(OperationLocks::new);

/// The process-wide volume lock set.
pub fn volume_locks() -> Arc<VolumeLocks> {
    VOLUME_LOCKS.clone()
}

/// The process-wide operation lock set.
pub fn operation_locks() -> Arc<OperationLocks> {
    OPERATION_LOCKS.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_lock_is_exclusive() {
        let locks = VolumeLocks::new();

        let guard = locks.try_acquire("vol-1").unwrap();
        assert!(matches!(
            locks.try_acquire("vol-1"),
            Err(EngineError::Aborted(_))
        ));
        // A holder re-acquiring its own key fails too: no re-entrance.
        assert!(locks.is_held("vol-1"));

        drop(guard);
        assert!(!locks.is_held("vol-1"));
        let _guard = locks.try_acquire("vol-1").unwrap();
    }

    #[test]
    fn test_volume_locks_are_per_key() {
        let locks = VolumeLocks::new();
        let _a = locks.try_acquire("vol-1").unwrap();
        let _b = locks.try_acquire("vol-2").unwrap();
    }

    #[test]
    fn test_release_on_every_path() {
        let locks = VolumeLocks::new();
        {
            let _guard = locks.try_acquire("vol-1").unwrap();
            // Early returns and errors drop the guard all the same.
        }
        assert!(!locks.is_held("vol-1"));
    }

    #[test]
    fn test_clone_and_delete_exclude_each_other() {
        let locks = OperationLocks::new();

        let clone_guard = locks.try_acquire(Operation::Clone, "src-1").unwrap();
        assert!(matches!(
            locks.try_acquire(Operation::Delete, "src-1"),
            Err(EngineError::Aborted(_))
        ));
        drop(clone_guard);

        let delete_guard = locks.try_acquire(Operation::Delete, "src-1").unwrap();
        assert!(matches!(
            locks.try_acquire(Operation::Clone, "src-1"),
            Err(EngineError::Aborted(_))
        ));
        assert!(matches!(
            locks.try_acquire(Operation::Restore, "src-1"),
            Err(EngineError::Aborted(_))
        ));
        drop(delete_guard);
    }

    #[test]
    fn test_compatible_operations_overlap() {
        let locks = OperationLocks::new();

        // Multiple clones of the same source may run together.
        let _a = locks.try_acquire(Operation::Clone, "src-1").unwrap();
        let _b = locks.try_acquire(Operation::Clone, "src-1").unwrap();
        let _c = locks.try_acquire(Operation::Expand, "src-1").unwrap();
    }

    #[test]
    fn test_counts_drain_before_delete_admits() {
        let locks = OperationLocks::new();

        let a = locks.try_acquire(Operation::Clone, "src-1").unwrap();
        let b = locks.try_acquire(Operation::Clone, "src-1").unwrap();
        drop(a);
        // One clone still in flight.
        assert!(locks.try_acquire(Operation::Delete, "src-1").is_err());
        drop(b);
        let _d = locks.try_acquire(Operation::Delete, "src-1").unwrap();
    }
}
