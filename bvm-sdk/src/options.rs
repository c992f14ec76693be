//! Immutable run configuration.
//!
//! [`RunOptions`] is built once by the command-line layer and handed to the
//! [`Session`](crate::Session) by reference; the core never mutates it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};

/// A size in bytes parsed from `<n>[K|M|G|T]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(u64);

impl ByteSize {
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error returned when a size string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid size {0:?}: expected bytes with an optional K, M, G or T suffix")]
pub struct ParseSizeError(String);

impl FromStr for ByteSize {
    type Err = ParseSizeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let err = || ParseSizeError(s.to_owned());
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, suffix) = trimmed.split_at(split);
        if digits.is_empty() {
            return Err(err());
        }
        let value: u64 = digits.parse().map_err(|_| err())?;

        let suffix = suffix.to_ascii_uppercase();
        let unit = suffix
            .strip_suffix("IB")
            .or_else(|| suffix.strip_suffix('B'))
            .unwrap_or(&suffix);
        let shift = match unit {
            "" => 0,
            "K" => 10,
            "M" => 20,
            "G" => 30,
            "T" => 40,
            _ => return Err(err()),
        };
        value
            .checked_mul(1u64 << shift)
            .map(ByteSize)
            .ok_or_else(err)
    }
}

/// Overrides passed to the disk image installer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskImageConfig {
    /// Root filesystem type (e.g. `xfs`, `btrfs`, `ext4`).
    pub filesystem: Option<String>,
    /// Maximum size of the root filesystem.
    pub root_size_max: Option<ByteSize>,
    /// Size of the allocated disk image.
    pub disk_size: Option<ByteSize>,
}

/// Options for a single run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    user: String,
    cloud_init_dir: Option<PathBuf>,
    disk: DiskImageConfig,
    background: bool,
    no_credentials: bool,
    remove_vm: bool,
    quiet: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            user: "root".to_owned(),
            cloud_init_dir: None,
            disk: DiskImageConfig::default(),
            background: false,
            no_credentials: false,
            remove_vm: false,
            quiet: false,
        }
    }
}

impl RunOptions {
    pub fn builder() -> RunOptionsBuilder {
        RunOptionsBuilder::default()
    }

    /// User to log in as inside the VM.
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn cloud_init_dir(&self) -> Option<&Path> {
        self.cloud_init_dir.as_deref()
    }

    pub fn disk(&self) -> &DiskImageConfig {
        &self.disk
    }

    /// Whether the run ends once the VM is up.
    ///
    /// Without injected credentials there is no way to log in, so
    /// `no_credentials` always implies background mode.
    pub fn background(&self) -> bool {
        self.background || self.no_credentials
    }

    pub fn no_credentials(&self) -> bool {
        self.no_credentials
    }

    pub fn remove_vm(&self) -> bool {
        self.remove_vm
    }

    pub fn quiet(&self) -> bool {
        self.quiet
    }

    /// Reject flag combinations that cannot be honoured.
    ///
    /// - An empty `user`.
    /// - `remove_vm` in background mode: the VM would be deleted as soon as
    ///   it booted.
    /// - A remote command in background mode, including `no_credentials`.
    ///   Background runs return once the VM is up and never open an SSH
    ///   session, so the command would be silently dropped.
    /// - A `cloud_init_dir` that is not a directory.
    pub fn validate(&self, remote_cmd: &[String]) -> Result<()> {
        if self.user.is_empty() {
            return Err(Error::InvalidOptions("--user must not be empty".into()));
        }
        if self.remove_vm && self.background() {
            return Err(Error::InvalidOptions(
                "`--rm` cannot be used with `--background` or `--no-creds`".into(),
            ));
        }
        if !remote_cmd.is_empty() && self.background() {
            return Err(Error::InvalidOptions(
                "a command cannot be run with `--background` or `--no-creds`".into(),
            ));
        }
        if let Some(dir) = &self.cloud_init_dir
            && !dir.is_dir()
        {
            return Err(Error::MissingPath(dir.clone()));
        }
        Ok(())
    }
}

/// Builder for [`RunOptions`].
#[derive(Debug, Clone, Default)]
pub struct RunOptionsBuilder {
    options: RunOptions,
}

impl RunOptionsBuilder {
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.options.user = user.into();
        self
    }

    pub fn cloud_init_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.cloud_init_dir = Some(dir.into());
        self
    }

    pub fn filesystem(mut self, filesystem: impl Into<String>) -> Self {
        self.options.disk.filesystem = Some(filesystem.into());
        self
    }

    pub fn root_size_max(mut self, size: ByteSize) -> Self {
        self.options.disk.root_size_max = Some(size);
        self
    }

    pub fn disk_size(mut self, size: ByteSize) -> Self {
        self.options.disk.disk_size = Some(size);
        self
    }

    pub fn background(mut self, background: bool) -> Self {
        self.options.background = background;
        self
    }

    pub fn no_credentials(mut self, no_credentials: bool) -> Self {
        self.options.no_credentials = no_credentials;
        self
    }

    pub fn remove_vm(mut self, remove_vm: bool) -> Self {
        self.options.remove_vm = remove_vm;
        self
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.options.quiet = quiet;
        self
    }

    pub fn build(self) -> RunOptions {
        self.options
    }
}
