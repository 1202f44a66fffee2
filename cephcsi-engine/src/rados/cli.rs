//! RADOS access through the `rados`/`ceph` CLIs.
//!
//! Deployments run the driver next to ceph-common, so object I/O shells out
//! the same way the image backends do. The librados write-op's atomicity
//! and version assertion are approximated here: `apply` serializes writers
//! through a per-object advisory lock and keeps the object generation in an
//! xattr. The trait boundary keeps a native librados store drop-in later.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{EngineError, Result};

use super::{ObjectStat, RadosCluster, RadosIoCtx, StoreOp, GENERATION_XATTR};

const LOCK_NAME: &str = "csi.op";

/// Cluster handle backed by the Ceph command-line tools.
#[derive(Clone)]
pub struct CliCluster {
    mon_host: String,
    user: String,
    keyring: PathBuf,
    rados_bin: String,
    ceph_bin: String,
}

impl CliCluster {
    pub fn new(mon_host: impl Into<String>, user: impl Into<String>, keyring: &Path) -> Self {
        Self {
            mon_host: mon_host.into(),
            user: user.into(),
            keyring: keyring.to_path_buf(),
            rados_bin: "rados".to_string(),
            ceph_bin: "ceph".to_string(),
        }
    }

    /// Authentication arguments shared by every invocation.
    fn auth_args(&self) -> Vec<String> {
        vec![
            "-m".to_string(),
            self.mon_host.clone(),
            "--id".to_string(),
            self.user.clone(),
            "--keyring".to_string(),
            self.keyring.display().to_string(),
        ]
    }

    async fn run(&self, bin: &str, args: &[String]) -> Result<Output> {
        let mut all_args = args.to_vec();
        all_args.extend(self.auth_args());

        debug!(command = %bin, args = ?all_args, "Executing ceph command");

        let output = tokio::process::Command::new(bin)
            .args(&all_args)
            .output()
            .await
            .map_err(|e| EngineError::Internal(format!("failed to execute {bin}: {e}")))?;
        Ok(output)
    }

    async fn run_checked(&self, bin: &str, args: &[String]) -> Result<String> {
        let output = self.run(bin, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(command = %bin, stderr = %stderr, "ceph command failed");
            return Err(classify(&stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Map CLI stderr onto the engine taxonomy.
fn classify(stderr: &str) -> EngineError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("no such file or directory") || lower.contains("(2)") {
        EngineError::NotFound(stderr.trim().to_string())
    } else if lower.contains("file exists") || lower.contains("(17)") {
        EngineError::AlreadyExists(stderr.trim().to_string())
    } else if lower.contains("timed out")
        || lower.contains("connection")
        || lower.contains("(110)")
    {
        EngineError::BackendTransient(stderr.trim().to_string())
    } else {
        EngineError::BackendPermanent(stderr.trim().to_string())
    }
}

#[async_trait]
impl RadosCluster for CliCluster {
    async fn io_ctx(&self, pool: &str, namespace: &str) -> Result<Arc<dyn RadosIoCtx>> {
        Ok(Arc::new(CliIoCtx {
            cluster: self.clone(),
            pool: pool.to_string(),
            namespace: namespace.to_string(),
        }))
    }

    async fn pool_id(&self, pool: &str) -> Result<i64> {
        let out = self
            .run_checked(
                &self.ceph_bin,
                &[
                    "osd".to_string(),
                    "lspools".to_string(),
                    "--format".to_string(),
                    "json".to_string(),
                ],
            )
            .await?;
        let pools: Vec<serde_json::Value> = serde_json::from_str(&out)
            .map_err(|e| EngineError::Internal(format!("failed to parse pool listing: {e}")))?;
        pools
            .iter()
            .find(|p| p["poolname"].as_str() == Some(pool))
            .and_then(|p| p["poolnum"].as_i64())
            .ok_or_else(|| EngineError::NotFound(format!("pool {pool} not found")))
    }

    async fn pool_name(&self, pool_id: i64) -> Result<String> {
        let out = self
            .run_checked(
                &self.ceph_bin,
                &[
                    "osd".to_string(),
                    "lspools".to_string(),
                    "--format".to_string(),
                    "json".to_string(),
                ],
            )
            .await?;
        let pools: Vec<serde_json::Value> = serde_json::from_str(&out)
            .map_err(|e| EngineError::Internal(format!("failed to parse pool listing: {e}")))?;
        pools
            .iter()
            .find(|p| p["poolnum"].as_i64() == Some(pool_id))
            .and_then(|p| p["poolname"].as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| EngineError::NotFound(format!("no pool with id {pool_id}")))
    }
}

struct CliIoCtx {
    cluster: CliCluster,
    pool: String,
    namespace: String,
}

impl CliIoCtx {
    fn base_args(&self) -> Vec<String> {
        let mut args = vec!["-p".to_string(), self.pool.clone()];
        if !self.namespace.is_empty() {
            args.push("--namespace".to_string());
            args.push(self.namespace.clone());
        }
        args
    }

    async fn rados(&self, args: &[&str]) -> Result<String> {
        let mut all = self.base_args();
        all.extend(args.iter().map(|s| s.to_string()));
        self.cluster.run_checked(&self.cluster.rados_bin, &all).await
    }

    async fn generation(&self, oid: &str) -> Result<u64> {
        match self.get_xattr(oid, GENERATION_XATTR).await {
            Ok(Some(value)) => Ok(String::from_utf8_lossy(&value).trim().parse().unwrap_or(0)),
            Ok(None) => Ok(0),
            Err(EngineError::NotFound(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }

    async fn lock(&self, oid: &str) -> Result<String> {
        let cookie = Uuid::new_v4().to_string();
        self.rados(&[
            "lock",
            "get",
            oid,
            LOCK_NAME,
            "--lock-cookie",
            &cookie,
            "--lock-duration",
            "30",
        ])
        .await
        .map_err(|e| match e {
            // Contended advisory lock: another writer is mid-operation.
            EngineError::AlreadyExists(msg) | EngineError::BackendPermanent(msg) => {
                EngineError::BackendTransient(format!("object {oid} is locked: {msg}"))
            }
            other => other,
        })?;
        Ok(cookie)
    }

    async fn unlock(&self, oid: &str, cookie: &str) {
        let locker = format!("client.{}", self.cluster.user);
        if let Err(e) = self
            .rados(&[
                "lock",
                "break",
                oid,
                LOCK_NAME,
                &locker,
                "--lock-cookie",
                cookie,
            ])
            .await
        {
            // The lock expires on its own; losing the release only delays
            // the next writer.
            debug!(oid = %oid, error = %e, "failed to release advisory lock");
        }
    }

    async fn apply_one(&self, oid: &str, op: &StoreOp) -> Result<()> {
        match op {
            StoreOp::CreateExclusive => {
                if self.stat(oid).await?.is_some() {
                    return Err(EngineError::AlreadyExists(format!(
                        "object {oid} already exists"
                    )));
                }
                self.rados(&["create", oid]).await?;
            }
            StoreOp::WriteFull(data) => {
                let file = write_temp(data)?;
                let path = file.path().display().to_string();
                self.rados(&["put", oid, &path]).await?;
            }
            StoreOp::SetOmap(entries) => {
                for (key, value) in entries {
                    let value = String::from_utf8_lossy(value).to_string();
                    self.rados(&["setomapval", oid, key, &value]).await?;
                }
            }
            StoreOp::RemoveOmapKeys(keys) => {
                for key in keys {
                    match self.rados(&["rmomapkey", oid, key]).await {
                        Ok(_) | Err(EngineError::NotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            StoreOp::SetXattr { name, value } => {
                let value = String::from_utf8_lossy(value).to_string();
                self.rados(&["setxattr", oid, name, &value]).await?;
            }
            StoreOp::Remove => {
                match self.rados(&["rm", oid]).await {
                    Ok(_) | Err(EngineError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}

fn write_temp(data: &[u8]) -> Result<tempfile::NamedTempFile> {
    use std::io::Write;
    let mut file = tempfile::NamedTempFile::new()
        .map_err(|e| EngineError::Internal(format!("failed to create temp file: {e}")))?;
    file.write_all(data)
        .and_then(|_| file.flush())
        .map_err(|e| EngineError::Internal(format!("failed to write temp file: {e}")))?;
    Ok(file)
}

#[async_trait]
impl RadosIoCtx for CliIoCtx {
    fn pool(&self) -> &str {
        &self.pool
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn stat(&self, oid: &str) -> Result<Option<ObjectStat>> {
        let out = match self.rados(&["stat", oid]).await {
            Ok(out) => out,
            Err(EngineError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        // "pool/oid mtime <stamp>, size <n>"
        let size = out
            .rsplit("size")
            .next()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);
        let generation = self.generation(oid).await?;
        Ok(Some(ObjectStat { size, generation }))
    }

    async fn read(&self, oid: &str) -> Result<Vec<u8>> {
        let file = write_temp(&[])?;
        let path = file.path().display().to_string();
        self.rados(&["get", oid, &path]).await?;
        std::fs::read(file.path())
            .map_err(|e| EngineError::Internal(format!("failed to read temp file: {e}")))
    }

    async fn get_omap(&self, oid: &str, keys: &[&str]) -> Result<BTreeMap<String, Vec<u8>>> {
        if self.stat(oid).await?.is_none() {
            return Err(EngineError::NotFound(format!("object {oid} not found")));
        }
        let mut entries = BTreeMap::new();
        for key in keys {
            let file = write_temp(&[])?;
            let path = file.path().display().to_string();
            match self.rados(&["getomapval", oid, key, &path]).await {
                Ok(_) => {
                    let value = std::fs::read(file.path()).map_err(|e| {
                        EngineError::Internal(format!("failed to read temp file: {e}"))
                    })?;
                    entries.insert(key.to_string(), value);
                }
                Err(EngineError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(entries)
    }

    async fn list_omap(&self, oid: &str, prefix: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        let listing = self.rados(&["listomapkeys", oid]).await?;
        let keys: Vec<&str> = listing
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty() && l.starts_with(prefix))
            .collect();
        self.get_omap(oid, &keys).await
    }

    async fn get_xattr(&self, oid: &str, name: &str) -> Result<Option<Vec<u8>>> {
        match self.rados(&["getxattr", oid, name]).await {
            Ok(out) => Ok(Some(out.into_bytes())),
            Err(EngineError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn apply(
        &self,
        oid: &str,
        assert_generation: Option<u64>,
        ops: Vec<StoreOp>,
    ) -> Result<()> {
        let cookie = self.lock(oid).await?;

        let result = async {
            let current = self.generation(oid).await?;
            if let Some(expected) = assert_generation {
                if current != expected {
                    return Err(EngineError::ObjectOutOfDate(format!(
                        "object {oid}: generation {current} != asserted {expected}"
                    )));
                }
            }

            let mut removed = false;
            for op in &ops {
                self.apply_one(oid, op).await?;
                removed = removed || matches!(op, StoreOp::Remove);
            }

            if !removed {
                let next = (current + 1).to_string();
                self.apply_one(
                    oid,
                    &StoreOp::SetXattr {
                        name: GENERATION_XATTR.to_string(),
                        value: next.into_bytes(),
                    },
                )
                .await?;
            }
            Ok(())
        }
        .await;

        self.unlock(oid, &cookie).await;
        result
    }

    async fn remove(&self, oid: &str) -> Result<()> {
        match self.rados(&["rm", oid]).await {
            Ok(_) | Err(EngineError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
