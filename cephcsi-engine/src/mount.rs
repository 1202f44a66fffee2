//! Mount collaborators for the node service.
//!
//! CephFS can be attached through the kernel client or ceph-fuse; the two
//! share the small `{mount, unmount, probe}` capability set and are picked
//! per volume by the `mounter` parameter. Block devices from mapped RBD
//! images go through the plain helpers below. The engine only invokes the
//! system tools; filesystem formatting policy stays with the orchestrator
//! sidecars.

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::backend::CephConn;
use crate::error::{EngineError, Result};

/// Mounter selection from the `mounter` volume parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MounterType {
    #[default]
    Kernel,
    Fuse,
}

impl MounterType {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "kernel" => Ok(MounterType::Kernel),
            "fuse" => Ok(MounterType::Fuse),
            other => Err(EngineError::InvalidArgument(format!(
                "unknown mounter {other:?}, expected kernel or fuse"
            ))),
        }
    }
}

/// What to attach at a target path.
#[derive(Debug, Clone)]
pub struct CephFsSource<'a> {
    pub fs_name: &'a str,
    /// Path inside the filesystem, from `subvolume_path`.
    pub subvolume_path: &'a str,
}

/// A CephFS attach/detach capability.
#[async_trait]
pub trait Mounter: Send + Sync {
    async fn mount(
        &self,
        conn: &CephConn,
        source: &CephFsSource<'_>,
        target: &Path,
        options: &[String],
    ) -> Result<()>;

    async fn unmount(&self, target: &Path) -> Result<()>;

    /// Whether the mount tooling is usable on this node.
    async fn probe(&self) -> Result<()>;
}

/// Pick the mounter variant for a volume.
pub fn mounter_for(kind: MounterType) -> Box<dyn Mounter> {
    match kind {
        MounterType::Kernel => Box::new(KernelMounter),
        MounterType::Fuse => Box::new(FuseMounter),
    }
}

async fn run(tool: &str, args: &[&str]) -> Result<()> {
    debug!(command = %tool, args = ?args, "Executing mount command");
    let output = tokio::process::Command::new(tool)
        .args(args)
        .output()
        .await
        .map_err(|e| EngineError::Internal(format!("failed to execute {tool}: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EngineError::BackendPermanent(format!(
            "{tool} failed: {}",
            stderr.trim()
        )));
    }
    Ok(())
}

/// Kernel CephFS client (`mount -t ceph`).
pub struct KernelMounter;

#[async_trait]
impl Mounter for KernelMounter {
    async fn mount(
        &self,
        conn: &CephConn,
        source: &CephFsSource<'_>,
        target: &Path,
        options: &[String],
    ) -> Result<()> {
        let device = format!("{}:{}", conn.mon_host, source.subvolume_path);
        let mut opts = vec![
            format!("name={}", conn.user),
            format!("secretfile={}", conn.keyring.display()),
            format!("fs={}", source.fs_name),
        ];
        opts.extend(options.iter().cloned());
        let opts = opts.join(",");

        let target = target.display().to_string();
        run("mount", &["-t", "ceph", &device, &target, "-o", &opts]).await?;
        info!(target = %target, fs = %source.fs_name, "CephFS kernel mount complete");
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        let target = target.display().to_string();
        run("umount", &[&target]).await
    }

    async fn probe(&self) -> Result<()> {
        run("modprobe", &["ceph"]).await
    }
}

/// FUSE CephFS client (`ceph-fuse`).
pub struct FuseMounter;

#[async_trait]
impl Mounter for FuseMounter {
    async fn mount(
        &self,
        conn: &CephConn,
        source: &CephFsSource<'_>,
        target: &Path,
        options: &[String],
    ) -> Result<()> {
        let keyring = conn.keyring.display().to_string();
        let id = conn.user.clone();
        let target_str = target.display().to_string();
        let client_fs = format!("--client_fs={}", source.fs_name);

        let mut args: Vec<&str> = vec![
            "-m",
            &conn.mon_host,
            "--id",
            &id,
            "--keyring",
            &keyring,
            &client_fs,
            "-r",
            source.subvolume_path,
            &target_str,
        ];
        let extra: Vec<String> = options.iter().map(|o| format!("--{o}")).collect();
        args.extend(extra.iter().map(|s| s.as_str()));

        run("ceph-fuse", &args).await?;
        info!(target = %target_str, fs = %source.fs_name, "CephFS fuse mount complete");
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        let target = target.display().to_string();
        run("fusermount", &["-u", &target]).await
    }

    async fn probe(&self) -> Result<()> {
        run("ceph-fuse", &["--version"]).await
    }
}

/// Bind-mount a staged path into a publish target.
pub async fn bind_mount(source: &Path, target: &Path, readonly: bool) -> Result<()> {
    let source = source.display().to_string();
    let target = target.display().to_string();
    run("mount", &["--bind", &source, &target]).await?;
    if readonly {
        run("mount", &["-o", "remount,ro,bind", &target]).await?;
    }
    Ok(())
}

/// Mount a block device produced by `rbd map`.
pub async fn mount_device(device: &str, target: &Path, options: &[String]) -> Result<()> {
    let target = target.display().to_string();
    if options.is_empty() {
        run("mount", &[device, &target]).await
    } else {
        let opts = options.join(",");
        run("mount", &["-o", &opts, device, &target]).await
    }
}

/// Detach any mount at the target path; an unmounted target succeeds.
pub async fn unmount_path(target: &Path) -> Result<()> {
    let target_str = target.display().to_string();
    match run("umount", &[&target_str]).await {
        Ok(()) => Ok(()),
        Err(EngineError::BackendPermanent(msg)) if msg.contains("not mounted") => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mounter_type_parse() {
        assert_eq!(MounterType::parse("kernel").unwrap(), MounterType::Kernel);
        assert_eq!(MounterType::parse("fuse").unwrap(), MounterType::Fuse);
        assert!(matches!(
            MounterType::parse("nfs"),
            Err(EngineError::InvalidArgument(_))
        ));
    }
}
