//! Filesystem locations used by the default backends.

use std::path::{Path, PathBuf};

const APP_DIR: &str = "bootc-vm";

/// Cache and runtime directories.
///
/// The cache holds disk images and per-VM state, keyed by image id. The
/// runtime directory holds lock files and port claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    cache: PathBuf,
    runtime: PathBuf,
}

impl Paths {
    pub fn new(cache: impl Into<PathBuf>, runtime: impl Into<PathBuf>) -> Self {
        Self {
            cache: cache.into(),
            runtime: runtime.into(),
        }
    }

    /// Resolve from the environment.
    ///
    /// `BVM_CACHE_DIR` and `BVM_RUNTIME_DIR` override the XDG defaults.
    pub fn from_env() -> Self {
        let cache = env_dir("BVM_CACHE_DIR").unwrap_or_else(default_cache_dir);
        let runtime = env_dir("BVM_RUNTIME_DIR").unwrap_or_else(default_runtime_dir);
        Self { cache, runtime }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.runtime.join("locks")
    }

    pub fn port_dir(&self) -> PathBuf {
        self.runtime.join("ports")
    }
}

fn env_dir(var: &str) -> Option<PathBuf> {
    std::env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn default_cache_dir() -> PathBuf {
    if let Some(xdg) = env_dir("XDG_CACHE_HOME") {
        return xdg.join(APP_DIR);
    }
    match env_dir("HOME") {
        Some(home) => home.join(".cache").join(APP_DIR),
        None => std::env::temp_dir().join(APP_DIR).join("cache"),
    }
}

fn default_runtime_dir() -> PathBuf {
    if let Some(xdg) = env_dir("XDG_RUNTIME_DIR") {
        return xdg.join(APP_DIR);
    }
    // SAFETY: getuid has no preconditions and cannot fail.
    let uid = unsafe { libc::getuid() };
    std::env::temp_dir().join(format!("{APP_DIR}-{uid}"))
}
