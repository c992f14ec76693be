//! Host-wide advisory locks keyed by image identifier.
//!
//! Locks are `flock(2)` locks on `<lock_dir>/<image_id>.lock`. They are held
//! by an open file description, so they conflict across processes and across
//! separate opens within one process, and the kernel drops them when the
//! holder exits.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

/// Lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Any number of shared holders, no exclusive holder.
    Shared,
    /// A single holder.
    Exclusive,
}

/// Errors from acquiring or releasing an image lock.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("image {image_id} is locked by another process")]
    AlreadyLocked { image_id: String },

    #[error("lock file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Directory holding the lock files.
#[derive(Debug, Clone)]
pub struct LockDir {
    root: PathBuf,
}

impl LockDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Path of the lock file guarding `image_id`.
    pub fn lock_path(&self, image_id: &str) -> PathBuf {
        self.root.join(format!("{image_id}.lock"))
    }

    /// Try to acquire the lock for `image_id` without blocking.
    pub fn try_lock(&self, image_id: &str, mode: LockMode) -> Result<ImageLock, LockError> {
        let path = self.lock_path(image_id);
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(&self.root).map_err(io_err)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(io_err)?;

        let op = match mode {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        };
        if let Err(e) = flock(&file, op | libc::LOCK_NB) {
            if e.kind() == io::ErrorKind::WouldBlock {
                return Err(LockError::AlreadyLocked {
                    image_id: image_id.to_owned(),
                });
            }
            return Err(io_err(e));
        }

        Ok(ImageLock {
            image_id: image_id.to_owned(),
            path,
            mode,
            file: Some(file),
        })
    }
}

pub(crate) fn flock(file: &File, op: libc::c_int) -> io::Result<()> {
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// A held image lock.
///
/// Call [`unlock()`](Self::unlock) to release it and observe errors; dropping
/// it releases the lock silently.
#[derive(Debug)]
pub struct ImageLock {
    image_id: String,
    path: PathBuf,
    mode: LockMode,
    file: Option<File>,
}

impl ImageLock {
    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn unlock(mut self) -> Result<(), LockError> {
        match self.file.take() {
            Some(file) => flock(&file, libc::LOCK_UN).map_err(|source| LockError::Io {
                path: self.path.clone(),
                source,
            }),
            None => Ok(()),
        }
    }
}
