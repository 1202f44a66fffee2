//! Refcounted cache of cluster connections.
//!
//! Connections are keyed by (monitors, user, key fingerprint) so requests
//! with the same credentials share one handle. Entries are refcounted
//! through RAII guards and evicted when the last guard drops; since guards
//! live inside request scopes, no cached entry ever outlives the
//! credentials it was built from.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::credentials::Credentials;
use crate::error::Result;

use super::{CliCluster, RadosCluster};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConnectionKey {
    mon_host: String,
    user: String,
    fingerprint: String,
}

struct Entry {
    cluster: Arc<dyn RadosCluster>,
    refs: usize,
}

type Factory = dyn Fn(&str, &str, &Path) -> Result<Arc<dyn RadosCluster>> + Send + Sync;

/// Process-wide connection cache.
pub struct ConnectionPool {
    factory: Box<Factory>,
    entries: Mutex<HashMap<ConnectionKey, Entry>>,
}

impl ConnectionPool {
    /// Pool producing clusters through `factory(mon_host, user, keyring)`.
    pub fn new(factory: Box<Factory>) -> Arc<Self> {
        Arc::new(Self {
            factory,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Pool producing CLI-backed clusters, the production default.
    pub fn with_cli() -> Arc<Self> {
        Self::new(Box::new(|mon_host, user, keyring| {
            Ok(Arc::new(CliCluster::new(mon_host, user, keyring)) as Arc<dyn RadosCluster>)
        }))
    }

    /// Check out a connection for the given monitors and credentials,
    /// creating it on first use.
    pub fn get(
        self: &Arc<Self>,
        mon_host: &str,
        creds: &Credentials,
    ) -> Result<ConnectionGuard> {
        let key = ConnectionKey {
            mon_host: mon_host.to_string(),
            user: creds.user().to_string(),
            fingerprint: creds.key_fingerprint(),
        };

        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(&key) {
            entry.refs += 1;
            return Ok(ConnectionGuard {
                pool: self.clone(),
                key,
                cluster: entry.cluster.clone(),
            });
        }

        let cluster = (self.factory)(mon_host, creds.user(), creds.keyfile_path()?)?;
        entries.insert(
            key.clone(),
            Entry {
                cluster: cluster.clone(),
                refs: 1,
            },
        );
        debug!(mon_host = %mon_host, user = %creds.user(), "Cluster connection created");
        Ok(ConnectionGuard {
            pool: self.clone(),
            key,
            cluster,
        })
    }

    /// Number of live cached connections.
    pub fn active_connections(&self) -> usize {
        self.lock().len()
    }

    fn release(&self, key: &ConnectionKey) {
        let mut entries = self.lock();
        let drained = match entries.get_mut(key) {
            Some(entry) => {
                entry.refs = entry.refs.saturating_sub(1);
                entry.refs == 0
            }
            None => false,
        };
        if drained {
            entries.remove(key);
            debug!(mon_host = %key.mon_host, user = %key.user, "Cluster connection dropped");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionKey, Entry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Checked-out connection; returns itself to the pool on drop.
pub struct ConnectionGuard {
    pool: Arc<ConnectionPool>,
    key: ConnectionKey,
    cluster: Arc<dyn RadosCluster>,
}

impl ConnectionGuard {
    pub fn cluster(&self) -> &Arc<dyn RadosCluster> {
        &self.cluster
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.pool.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rados::MemoryCluster;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn creds() -> Credentials {
        let mut secrets = StdHashMap::new();
        secrets.insert("userID".to_string(), "csi-user".to_string());
        secrets.insert("userKey".to_string(), "secret-key".to_string());
        Credentials::from_secrets(&secrets).unwrap()
    }

    fn memory_pool(created: Arc<AtomicUsize>) -> Arc<ConnectionPool> {
        ConnectionPool::new(Box::new(move |_, _, _| {
            created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MemoryCluster::new()) as Arc<dyn RadosCluster>)
        }))
    }

    #[test]
    fn test_connections_are_shared_and_refcounted() {
        let created = Arc::new(AtomicUsize::new(0));
        let pool = memory_pool(created.clone());
        let creds = creds();

        let a = pool.get("10.0.0.1:6789", &creds).unwrap();
        let b = pool.get("10.0.0.1:6789", &creds).unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.active_connections(), 1);
        assert!(Arc::ptr_eq(a.cluster(), b.cluster()));

        drop(a);
        assert_eq!(pool.active_connections(), 1);
        drop(b);
        assert_eq!(pool.active_connections(), 0);

        // Next checkout builds a fresh connection.
        let _c = pool.get("10.0.0.1:6789", &creds).unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_distinct_credentials_get_distinct_connections() {
        let created = Arc::new(AtomicUsize::new(0));
        let pool = memory_pool(created.clone());

        let creds_a = creds();
        let mut secrets = StdHashMap::new();
        secrets.insert("userID".to_string(), "csi-user".to_string());
        secrets.insert("userKey".to_string(), "another-key".to_string());
        let creds_b = Credentials::from_secrets(&secrets).unwrap();

        let _a = pool.get("10.0.0.1:6789", &creds_a).unwrap();
        let _b = pool.get("10.0.0.1:6789", &creds_b).unwrap();
        assert_eq!(pool.active_connections(), 2);
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_distinct_monitors_get_distinct_connections() {
        let created = Arc::new(AtomicUsize::new(0));
        let pool = memory_pool(created);
        let creds = creds();

        let _a = pool.get("10.0.0.1:6789", &creds).unwrap();
        let _b = pool.get("10.0.0.2:6789", &creds).unwrap();
        assert_eq!(pool.active_connections(), 2);
    }
}
