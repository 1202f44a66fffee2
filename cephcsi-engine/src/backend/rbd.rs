//! RBD image backend driven by the `rbd` CLI.
//!
//! ## Prerequisites
//! - `ceph-common` installed (provides the `rbd` CLI)
//! - a keyring for the request credentials (the engine writes one per
//!   request)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument};

use crate::error::{EngineError, Result};

use super::{CephConn, ImageBackend, ImageStatus, MirrorState, MirrorStatus};

/// RBD image backend.
pub struct RbdCliBackend {
    /// rbd CLI binary path
    rbd_path: String,
}

impl RbdCliBackend {
    /// Create a new RBD backend with default settings.
    pub fn new() -> Self {
        Self {
            rbd_path: "rbd".to_string(),
        }
    }

    /// Create an RBD backend with a custom rbd binary path.
    pub fn with_rbd_path(rbd_path: impl Into<String>) -> Self {
        Self {
            rbd_path: rbd_path.into(),
        }
    }

    /// Get the RBD image spec (pool/namespace/image format).
    fn image_spec(pool: &str, namespace: &str, name: &str) -> String {
        if namespace.is_empty() {
            format!("{pool}/{name}")
        } else {
            format!("{pool}/{namespace}/{name}")
        }
    }

    /// Build common rbd CLI arguments for authentication.
    fn auth_args(conn: &CephConn) -> Vec<String> {
        vec![
            "--mon-host".to_string(),
            conn.mon_host.clone(),
            "--id".to_string(),
            conn.user.clone(),
            "--keyring".to_string(),
            conn.keyring.display().to_string(),
        ]
    }

    /// Execute an rbd command and return its stdout.
    async fn run_rbd(&self, conn: &CephConn, args: &[&str]) -> Result<String> {
        let auth_args = Self::auth_args(conn);

        let mut all_args: Vec<&str> = Vec::new();
        all_args.extend(args);
        all_args.extend(auth_args.iter().map(|s| s.as_str()));

        debug!(
            command = %self.rbd_path,
            args = ?all_args,
            "Executing rbd command"
        );

        let output = tokio::process::Command::new(&self.rbd_path)
            .args(&all_args)
            .output()
            .await
            .map_err(|e| EngineError::Internal(format!("failed to execute rbd: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(stderr = %stderr, "rbd command failed");
            return Err(classify(&stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Default for RbdCliBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(stderr: &str) -> EngineError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("no such file or directory") || lower.contains("(2)") {
        EngineError::NotFound(stderr.trim().to_string())
    } else if lower.contains("file exists") || lower.contains("(17)") {
        EngineError::AlreadyExists(stderr.trim().to_string())
    } else if lower.contains("timed out") || lower.contains("connection") {
        EngineError::BackendTransient(stderr.trim().to_string())
    } else {
        EngineError::BackendPermanent(stderr.trim().to_string())
    }
}

#[async_trait]
impl ImageBackend for RbdCliBackend {
    #[instrument(skip(self, conn), fields(pool = %pool, name = %name, size_bytes = %size_bytes))]
    async fn create_image(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
        size_bytes: u64,
        features: &[String],
    ) -> Result<()> {
        let spec = Self::image_spec(pool, namespace, name);
        let size_mb = (size_bytes / 1024 / 1024).max(1).to_string();
        let feature_list = features.join(",");

        let mut args = vec!["create", "--size", &size_mb];
        if !features.is_empty() {
            args.push("--image-feature");
            args.push(&feature_list);
        }
        args.push(&spec);

        self.run_rbd(conn, &args).await?;
        info!(image = %spec, "RBD image created");
        Ok(())
    }

    async fn image_status(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ImageStatus>> {
        let spec = Self::image_spec(pool, namespace, name);
        let out = match self
            .run_rbd(conn, &["info", &spec, "--format", "json"])
            .await
        {
            Ok(out) => out,
            Err(EngineError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let info: serde_json::Value = serde_json::from_str(&out)
            .map_err(|e| EngineError::Internal(format!("failed to parse rbd info output: {e}")))?;
        Ok(Some(ImageStatus {
            size_bytes: info["size"].as_u64().unwrap_or(0),
            features: info["features"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|f| f.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default(),
        }))
    }

    #[instrument(skip(self, conn), fields(pool = %pool, name = %name))]
    async fn delete_image(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let spec = Self::image_spec(pool, namespace, name);

        // Snapshots hold the image alive; purge them first.
        match self.run_rbd(conn, &["snap", "purge", &spec]).await {
            Ok(_) | Err(EngineError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        match self.run_rbd(conn, &["rm", &spec]).await {
            Ok(_) => {
                info!(image = %spec, "RBD image deleted");
                Ok(())
            }
            Err(EngineError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, conn), fields(pool = %pool, name = %name, new_size_bytes = %new_size_bytes))]
    async fn resize_image(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
        new_size_bytes: u64,
    ) -> Result<()> {
        let spec = Self::image_spec(pool, namespace, name);
        let size_mb = (new_size_bytes / 1024 / 1024).to_string();
        self.run_rbd(conn, &["resize", "--size", &size_mb, &spec])
            .await?;
        info!(image = %spec, "RBD image resized");
        Ok(())
    }

    #[instrument(skip(self, conn), fields(pool = %pool, image = %image, snapshot = %snapshot))]
    async fn create_snapshot(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        image: &str,
        snapshot: &str,
    ) -> Result<()> {
        let spec = Self::image_spec(pool, namespace, image);
        let snap_spec = format!("{spec}@{snapshot}");
        self.run_rbd(conn, &["snap", "create", &snap_spec]).await?;
        info!(snapshot = %snap_spec, "RBD snapshot created");
        Ok(())
    }

    async fn delete_snapshot(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        image: &str,
        snapshot: &str,
    ) -> Result<()> {
        let spec = Self::image_spec(pool, namespace, image);
        let snap_spec = format!("{spec}@{snapshot}");

        // Unprotect before removal; an unprotected snapshot rejects the
        // call harmlessly.
        let _ = self.run_rbd(conn, &["snap", "unprotect", &snap_spec]).await;

        match self.run_rbd(conn, &["snap", "rm", &snap_spec]).await {
            Ok(_) | Err(EngineError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn snapshot_exists(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        image: &str,
        snapshot: &str,
    ) -> Result<bool> {
        let spec = Self::image_spec(pool, namespace, image);
        let out = match self
            .run_rbd(conn, &["snap", "ls", &spec, "--format", "json"])
            .await
        {
            Ok(out) => out,
            Err(EngineError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let snaps: Vec<serde_json::Value> = serde_json::from_str(&out)
            .map_err(|e| EngineError::Internal(format!("failed to parse snap listing: {e}")))?;
        Ok(snaps
            .iter()
            .any(|s| s["name"].as_str() == Some(snapshot)))
    }

    #[instrument(skip(self, conn), fields(pool = %pool, source = %source_image, dest = %dest_name))]
    async fn clone_image(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        source_image: &str,
        source_snapshot: &str,
        dest_name: &str,
        features: &[String],
    ) -> Result<()> {
        let src = format!(
            "{}@{}",
            Self::image_spec(pool, namespace, source_image),
            source_snapshot
        );
        let dst = Self::image_spec(pool, namespace, dest_name);

        // Protect is required before cloning; an already-protected
        // snapshot rejects the call harmlessly.
        let _ = self.run_rbd(conn, &["snap", "protect", &src]).await;

        let feature_list = features.join(",");
        let mut args = vec!["clone", &src, &dst];
        if !features.is_empty() {
            args.push("--image-feature");
            args.push(&feature_list);
        }
        self.run_rbd(conn, &args).await?;
        info!(source = %src, dest = %dst, "RBD image cloned");
        Ok(())
    }

    async fn flatten_image(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let spec = Self::image_spec(pool, namespace, name);
        match self.run_rbd(conn, &["flatten", &spec]).await {
            Ok(_) => {
                info!(image = %spec, "RBD image flattened");
                Ok(())
            }
            // Images without a parent reject flatten; nothing to detach.
            Err(EngineError::BackendPermanent(msg)) if msg.contains("parent") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn map_image(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
        map_options: Option<&str>,
    ) -> Result<String> {
        let spec = Self::image_spec(pool, namespace, name);
        let mut args = vec!["map", &spec];
        if let Some(options) = map_options {
            args.push("--options");
            args.push(options);
        }
        let out = self.run_rbd(conn, &args).await?;
        Ok(out.trim().to_string())
    }

    async fn unmap_image(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let spec = Self::image_spec(pool, namespace, name);
        match self.run_rbd(conn, &["unmap", &spec]).await {
            Ok(_) | Err(EngineError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn mirror_enable(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
        mode: &str,
    ) -> Result<()> {
        let spec = Self::image_spec(pool, namespace, name);
        self.run_rbd(conn, &["mirror", "image", "enable", &spec, mode])
            .await?;
        info!(image = %spec, mode = %mode, "RBD mirroring enabled");
        Ok(())
    }

    async fn mirror_disable(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
        force: bool,
    ) -> Result<()> {
        let spec = Self::image_spec(pool, namespace, name);
        let mut args = vec!["mirror", "image", "disable", &spec];
        if force {
            args.push("--force");
        }
        self.run_rbd(conn, &args).await?;
        info!(image = %spec, "RBD mirroring disabled");
        Ok(())
    }

    async fn mirror_promote(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
        force: bool,
    ) -> Result<()> {
        let spec = Self::image_spec(pool, namespace, name);
        let mut args = vec!["mirror", "image", "promote", &spec];
        if force {
            args.push("--force");
        }
        self.run_rbd(conn, &args).await?;
        info!(image = %spec, "RBD image promoted");
        Ok(())
    }

    async fn mirror_demote(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let spec = Self::image_spec(pool, namespace, name);
        self.run_rbd(conn, &["mirror", "image", "demote", &spec])
            .await?;
        info!(image = %spec, "RBD image demoted");
        Ok(())
    }

    async fn mirror_resync(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let spec = Self::image_spec(pool, namespace, name);
        self.run_rbd(conn, &["mirror", "image", "resync", &spec])
            .await?;
        info!(image = %spec, "RBD image resync requested");
        Ok(())
    }

    async fn mirror_status(
        &self,
        conn: &CephConn,
        pool: &str,
        namespace: &str,
        name: &str,
    ) -> Result<MirrorStatus> {
        let spec = Self::image_spec(pool, namespace, name);
        let out = self
            .run_rbd(conn, &["mirror", "image", "status", &spec, "--format", "json"])
            .await?;
        let status: serde_json::Value = serde_json::from_str(&out).map_err(|e| {
            EngineError::Internal(format!("failed to parse mirror status output: {e}"))
        })?;

        let description = status["description"].as_str().unwrap_or("").to_string();
        let state = match status["state"].as_str().unwrap_or("") {
            s if s.contains("stopped") && description.contains("primary") => MirrorState::Primary,
            "up+stopped" | "up+replaying" | "up+syncing" => MirrorState::Secondary,
            "down+unknown" | "" => MirrorState::Disabled,
            _ => MirrorState::Secondary,
        };
        let last_sync = status["last_update"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));

        Ok(MirrorStatus {
            state,
            up_to_date: description.contains("idle") || description.contains("replaying"),
            description,
            last_sync,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_spec_without_namespace() {
        assert_eq!(
            RbdCliBackend::image_spec("rbd", "", "csi-vol-1"),
            "rbd/csi-vol-1"
        );
    }

    #[test]
    fn test_image_spec_with_namespace() {
        assert_eq!(
            RbdCliBackend::image_spec("rbd", "tenant1", "csi-vol-1"),
            "rbd/tenant1/csi-vol-1"
        );
    }

    #[test]
    fn test_auth_args() {
        let conn = CephConn {
            mon_host: "10.0.0.1:6789,10.0.0.2:6789".to_string(),
            user: "csi-user".to_string(),
            keyring: "/tmp/keyring".into(),
        };
        let args = RbdCliBackend::auth_args(&conn);
        assert!(args.contains(&"--mon-host".to_string()));
        assert!(args.contains(&"--id".to_string()));
        assert!(args.contains(&"csi-user".to_string()));
        assert!(args.contains(&"--keyring".to_string()));
    }

    #[test]
    fn test_classify_errors() {
        assert!(matches!(
            classify("rbd: error: (2) No such file or directory"),
            EngineError::NotFound(_)
        ));
        assert!(matches!(
            classify("rbd: error: (17) File exists"),
            EngineError::AlreadyExists(_)
        ));
        assert!(matches!(
            classify("rbd: connection timed out"),
            EngineError::BackendTransient(_)
        ));
        assert!(matches!(
            classify("rbd: unknown feature"),
            EngineError::BackendPermanent(_)
        ));
    }
}
