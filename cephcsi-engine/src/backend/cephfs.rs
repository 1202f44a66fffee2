//! CephFS subvolume backend driven by the `ceph fs subvolume` CLI family.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, instrument};

use crate::error::{EngineError, Result};

use super::{CephConn, FsBackend, SubvolumeStatus};

/// How long a subvolume clone may stay in flight before we give up on it.
const CLONE_WAIT: Duration = Duration::from_secs(60);
const CLONE_POLL: Duration = Duration::from_secs(2);

/// CephFS subvolume backend.
pub struct CephFsCliBackend {
    /// ceph CLI binary path
    ceph_path: String,
}

impl CephFsCliBackend {
    /// Create a new CephFS backend with default settings.
    pub fn new() -> Self {
        Self {
            ceph_path: "ceph".to_string(),
        }
    }

    /// Create a CephFS backend with a custom ceph binary path.
    pub fn with_ceph_path(ceph_path: impl Into<String>) -> Self {
        Self {
            ceph_path: ceph_path.into(),
        }
    }

    fn auth_args(conn: &CephConn) -> Vec<String> {
        vec![
            "-m".to_string(),
            conn.mon_host.clone(),
            "--id".to_string(),
            conn.user.clone(),
            "--keyring".to_string(),
            conn.keyring.display().to_string(),
        ]
    }

    async fn run_ceph(&self, conn: &CephConn, args: &[&str]) -> Result<String> {
        let auth_args = Self::auth_args(conn);

        let mut all_args: Vec<&str> = Vec::new();
        all_args.extend(args);
        all_args.extend(auth_args.iter().map(|s| s.as_str()));

        debug!(
            command = %self.ceph_path,
            args = ?all_args,
            "Executing ceph command"
        );

        let output = tokio::process::Command::new(&self.ceph_path)
            .args(&all_args)
            .output()
            .await
            .map_err(|e| EngineError::Internal(format!("failed to execute ceph: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(stderr = %stderr, "ceph command failed");
            return Err(classify(&stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Default for CephFsCliBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(stderr: &str) -> EngineError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("enoent") || lower.contains("does not exist") || lower.contains("(2)") {
        EngineError::NotFound(stderr.trim().to_string())
    } else if lower.contains("eexist") || lower.contains("(17)") {
        EngineError::AlreadyExists(stderr.trim().to_string())
    } else if lower.contains("timed out") || lower.contains("connection") {
        EngineError::BackendTransient(stderr.trim().to_string())
    } else {
        EngineError::BackendPermanent(stderr.trim().to_string())
    }
}

#[async_trait]
impl FsBackend for CephFsCliBackend {
    #[instrument(skip(self, conn), fields(fs = %fs_name, group = %group, name = %name, size_bytes = %size_bytes))]
    async fn create_subvolume(
        &self,
        conn: &CephConn,
        fs_name: &str,
        group: &str,
        name: &str,
        size_bytes: u64,
    ) -> Result<()> {
        let size = size_bytes.to_string();
        self.run_ceph(
            conn,
            &[
                "fs",
                "subvolume",
                "create",
                fs_name,
                name,
                &size,
                "--group_name",
                group,
            ],
        )
        .await?;
        info!("CephFS subvolume created");
        Ok(())
    }

    async fn subvolume_status(
        &self,
        conn: &CephConn,
        fs_name: &str,
        group: &str,
        name: &str,
    ) -> Result<Option<SubvolumeStatus>> {
        let out = match self
            .run_ceph(
                conn,
                &[
                    "fs",
                    "subvolume",
                    "info",
                    fs_name,
                    name,
                    "--group_name",
                    group,
                    "--format",
                    "json",
                ],
            )
            .await
        {
            Ok(out) => out,
            Err(EngineError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let info: serde_json::Value = serde_json::from_str(&out).map_err(|e| {
            EngineError::Internal(format!("failed to parse subvolume info output: {e}"))
        })?;
        Ok(Some(SubvolumeStatus {
            size_bytes: info["bytes_quota"].as_u64().unwrap_or(0),
        }))
    }

    #[instrument(skip(self, conn), fields(fs = %fs_name, group = %group, name = %name))]
    async fn delete_subvolume(
        &self,
        conn: &CephConn,
        fs_name: &str,
        group: &str,
        name: &str,
    ) -> Result<()> {
        match self
            .run_ceph(
                conn,
                &[
                    "fs",
                    "subvolume",
                    "rm",
                    fs_name,
                    name,
                    "--group_name",
                    group,
                    "--retain-snapshots",
                ],
            )
            .await
        {
            Ok(_) => {
                info!("CephFS subvolume deleted");
                Ok(())
            }
            Err(EngineError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn resize_subvolume(
        &self,
        conn: &CephConn,
        fs_name: &str,
        group: &str,
        name: &str,
        new_size_bytes: u64,
    ) -> Result<()> {
        let size = new_size_bytes.to_string();
        self.run_ceph(
            conn,
            &[
                "fs",
                "subvolume",
                "resize",
                fs_name,
                name,
                &size,
                "--group_name",
                group,
            ],
        )
        .await?;
        info!(fs = %fs_name, name = %name, "CephFS subvolume resized");
        Ok(())
    }

    async fn subvolume_path(
        &self,
        conn: &CephConn,
        fs_name: &str,
        group: &str,
        name: &str,
    ) -> Result<String> {
        let out = self
            .run_ceph(
                conn,
                &[
                    "fs",
                    "subvolume",
                    "getpath",
                    fs_name,
                    name,
                    "--group_name",
                    group,
                ],
            )
            .await?;
        Ok(out.trim().to_string())
    }

    #[instrument(skip(self, conn), fields(fs = %fs_name, subvolume = %subvolume, snapshot = %snapshot))]
    async fn create_subvolume_snapshot(
        &self,
        conn: &CephConn,
        fs_name: &str,
        group: &str,
        subvolume: &str,
        snapshot: &str,
    ) -> Result<()> {
        self.run_ceph(
            conn,
            &[
                "fs",
                "subvolume",
                "snapshot",
                "create",
                fs_name,
                subvolume,
                snapshot,
                "--group_name",
                group,
            ],
        )
        .await?;
        info!("CephFS subvolume snapshot created");
        Ok(())
    }

    async fn delete_subvolume_snapshot(
        &self,
        conn: &CephConn,
        fs_name: &str,
        group: &str,
        subvolume: &str,
        snapshot: &str,
    ) -> Result<()> {
        match self
            .run_ceph(
                conn,
                &[
                    "fs",
                    "subvolume",
                    "snapshot",
                    "rm",
                    fs_name,
                    subvolume,
                    snapshot,
                    "--group_name",
                    group,
                ],
            )
            .await
        {
            Ok(_) | Err(EngineError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn subvolume_snapshot_exists(
        &self,
        conn: &CephConn,
        fs_name: &str,
        group: &str,
        subvolume: &str,
        snapshot: &str,
    ) -> Result<bool> {
        match self
            .run_ceph(
                conn,
                &[
                    "fs",
                    "subvolume",
                    "snapshot",
                    "info",
                    fs_name,
                    subvolume,
                    snapshot,
                    "--group_name",
                    group,
                ],
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(EngineError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, conn), fields(fs = %fs_name, source = %source_subvolume, dest = %dest_name))]
    async fn clone_subvolume_snapshot(
        &self,
        conn: &CephConn,
        fs_name: &str,
        group: &str,
        source_subvolume: &str,
        snapshot: &str,
        dest_name: &str,
    ) -> Result<()> {
        self.run_ceph(
            conn,
            &[
                "fs",
                "subvolume",
                "snapshot",
                "clone",
                fs_name,
                source_subvolume,
                snapshot,
                dest_name,
                "--group_name",
                group,
                "--target_group_name",
                group,
            ],
        )
        .await?;

        // Clones complete asynchronously; poll until the clone leaves the
        // in-progress states or the budget runs out.
        let deadline = tokio::time::Instant::now() + CLONE_WAIT;
        loop {
            let out = self
                .run_ceph(
                    conn,
                    &[
                        "fs",
                        "clone",
                        "status",
                        fs_name,
                        dest_name,
                        "--group_name",
                        group,
                        "--format",
                        "json",
                    ],
                )
                .await?;
            let status: serde_json::Value = serde_json::from_str(&out).map_err(|e| {
                EngineError::Internal(format!("failed to parse clone status output: {e}"))
            })?;
            match status["status"]["state"].as_str().unwrap_or("") {
                "complete" => {
                    info!("CephFS subvolume clone completed");
                    return Ok(());
                }
                "failed" => {
                    return Err(EngineError::BackendPermanent(format!(
                        "clone of {source_subvolume}@{snapshot} into {dest_name} failed"
                    )))
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::BackendTransient(format!(
                    "clone of {source_subvolume}@{snapshot} into {dest_name} still in progress"
                )));
            }
            tokio::time::sleep(CLONE_POLL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_errors() {
        assert!(matches!(
            classify("Error ENOENT: subvolume 'x' does not exist"),
            EngineError::NotFound(_)
        ));
        assert!(matches!(
            classify("Error EEXIST: subvolume 'x' exists"),
            EngineError::AlreadyExists(_)
        ));
        assert!(matches!(
            classify("error connecting to the cluster"),
            EngineError::BackendTransient(_)
        ));
    }
}
