//! Disk images built with `bootc install to-disk`.
//!
//! Each image gets a cache directory named after its image id:
//!
//! ```text
//! <cache>/<image-id>/disk.raw    raw disk written by bootc
//! <cache>/<image-id>/disk.json   what the disk was built from
//! <cache>/<image-id>/vm/         per-VM state (see `qemu`)
//! ```
//!
//! A disk is reused when its recorded image id and overrides match the
//! request. Rebuilding takes the image's exclusive lock and is refused while
//! a VM still runs from the disk.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use crate::backend::{DiskImage, DiskImageInstaller};
use crate::error::BoxError;
use crate::lock::{LockDir, LockMode};
use crate::options::{ByteSize, DiskImageConfig};
use crate::podman::PodmanConnection;
use crate::qemu;

pub const DISK_FILE: &str = "disk.raw";
const DISK_META_FILE: &str = "disk.json";
const DEFAULT_DISK_SIZE: ByteSize = ByteSize::from_bytes(10 << 30);

/// Builds disks by running `bootc install to-disk` inside the image.
#[derive(Debug, Clone)]
pub struct BootcDiskInstaller {
    cache_root: PathBuf,
    locks: LockDir,
    podman_bin: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DiskMeta {
    image_id: String,
    image_ref: String,
    filesystem: Option<String>,
    root_size_max: Option<u64>,
    disk_size: u64,
}

impl DiskMeta {
    fn new(image_id: &str, image_ref: &str, config: &DiskImageConfig) -> Self {
        Self {
            image_id: image_id.to_owned(),
            image_ref: image_ref.to_owned(),
            filesystem: config.filesystem.clone(),
            root_size_max: config.root_size_max.map(ByteSize::as_bytes),
            disk_size: config.disk_size.unwrap_or(DEFAULT_DISK_SIZE).as_bytes(),
        }
    }

    /// Whether a disk built from `self` satisfies `wanted`.
    fn satisfies(&self, wanted: &DiskMeta) -> bool {
        self.image_id == wanted.image_id
            && self.filesystem == wanted.filesystem
            && self.root_size_max == wanted.root_size_max
            && self.disk_size == wanted.disk_size
    }
}

impl BootcDiskInstaller {
    /// Cache disks under `cache_root`, locking images through `locks`.
    pub fn new(cache_root: impl Into<PathBuf>, locks: LockDir) -> Self {
        Self {
            cache_root: cache_root.into(),
            locks,
            podman_bin: PathBuf::from("podman"),
        }
    }

    pub fn podman_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.podman_bin = bin.into();
        self
    }

    fn cached(&self, dir: &Path, wanted: &DiskMeta) -> bool {
        if !dir.join(DISK_FILE).exists() {
            return false;
        }
        std::fs::read(dir.join(DISK_META_FILE))
            .ok()
            .and_then(|bytes| serde_json::from_slice::<DiskMeta>(&bytes).ok())
            .is_some_and(|meta| meta.satisfies(wanted))
    }

    fn install_args(
        &self,
        remote: &Remote<'_>,
        image_id: &str,
        dir: &Path,
        meta: &DiskMeta,
    ) -> Vec<String> {
        let mut args = vec!["--remote".to_owned(), "--url".to_owned(), remote.uri.clone()];
        if let Some(identity) = remote.identity {
            args.push("--identity".to_owned());
            args.push(identity.display().to_string());
        }
        args.extend([
            "run".to_owned(),
            "--rm".to_owned(),
            "--privileged".to_owned(),
            "--pid=host".to_owned(),
            "--security-opt".to_owned(),
            "label=type:unconfined_t".to_owned(),
            "-v".to_owned(),
            "/var/lib/containers:/var/lib/containers".to_owned(),
            "-v".to_owned(),
            "/dev:/dev".to_owned(),
            "-v".to_owned(),
            format!("{}:/output", dir.display()),
            image_id.to_owned(),
            "bootc".to_owned(),
            "install".to_owned(),
            "to-disk".to_owned(),
            "--via-loopback".to_owned(),
            "--generic-image".to_owned(),
            "--skip-fetch-check".to_owned(),
            "--wipe".to_owned(),
        ]);

        if let Some(fs) = &meta.filesystem {
            args.push("--filesystem".to_owned());
            args.push(fs.clone());
        }

        if let Some(size) = meta.root_size_max {
            args.push("--root-size".to_owned());
            args.push(format!("{}M", size >> 20));
        }

        args.push(format!("/output/{DISK_FILE}"));
        args
    }
}

/// How `podman --remote` reaches the machine.
struct Remote<'a> {
    uri: String,
    identity: Option<&'a Path>,
}

impl BootcDiskInstaller {
    /// Write a fresh disk for `image` while holding its exclusive lock.
    async fn rebuild(
        &self,
        remote: &Remote<'_>,
        image: &DiskImage,
        wanted: &DiskMeta,
        quiet: bool,
    ) -> Result<(), BoxError> {
        let lock = self.locks.try_lock(&image.image_id, LockMode::Exclusive)?;
        if let Some(pid) = qemu::running_pid(&qemu::vm_dir(&image.cache_dir)) {
            return Err(format!(
                "a VM for image {} is still running from its disk (pid {pid})",
                image.image_id
            )
            .into());
        }

        let dir = &image.cache_dir;
        tokio::fs::create_dir_all(dir).await?;
        // The disk never looks complete while it is being written.
        match tokio::fs::remove_file(dir.join(DISK_META_FILE)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        let disk = tokio::fs::File::create(&image.disk_path).await?;
        disk.set_len(wanted.disk_size).await?;
        drop(disk);

        info!(
            image = %image.image_ref,
            disk = %image.disk_path.display(),
            "installing bootc disk image"
        );
        let mut cmd = Command::new(&self.podman_bin);
        cmd.args(self.install_args(remote, &image.image_id, dir, wanted));
        if quiet {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        let status = cmd.status().await?;
        if !status.success() {
            tokio::fs::remove_file(&image.disk_path).await.ok();
            return Err(format!("bootc install to-disk failed: {status}").into());
        }

        tokio::fs::write(dir.join(DISK_META_FILE), serde_json::to_vec_pretty(wanted)?).await?;
        lock.unlock()?;
        Ok(())
    }
}

impl DiskImageInstaller<PodmanConnection> for BootcDiskInstaller {
    async fn install(
        &self,
        connection: &PodmanConnection,
        image_ref: &str,
        config: &DiskImageConfig,
        quiet: bool,
    ) -> Result<DiskImage, BoxError> {
        let image_id = match connection.image_id(image_ref).await? {
            Some(id) => id,
            None => {
                info!(image = image_ref, "pulling image");
                connection.pull(image_ref).await?;
                connection
                    .image_id(image_ref)
                    .await?
                    .ok_or_else(|| format!("image {image_ref} not found after pull"))?
            }
        };

        let dir = self.cache_root.join(&image_id);
        let disk_path = dir.join(DISK_FILE);
        let wanted = DiskMeta::new(&image_id, image_ref, config);
        let image = DiskImage {
            image_id: image_id.clone(),
            image_ref: image_ref.to_owned(),
            disk_path: disk_path.clone(),
            cache_dir: dir.clone(),
        };

        if self.cached(&dir, &wanted) {
            debug!(%image_id, "reusing cached disk image");
            return Ok(image);
        }

        let remote = Remote {
            uri: connection.uri(),
            identity: connection.authenticated().then(|| connection.identity()),
        };
        self.rebuild(&remote, &image, &wanted, quiet).await?;
        Ok(image)
    }
}
