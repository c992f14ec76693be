use std::path::PathBuf;
use std::time::Duration;

use crate::lock::LockError;

/// Boxed error returned by collaborator implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A step of the run that can fail after the VM handle exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeStep {
    /// Starting the VM.
    Run,
    /// Persisting the VM run configuration.
    WriteConfig,
    /// Deleting the VM after the session ended.
    Delete,
}

impl std::fmt::Display for RuntimeStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Run => "run VM",
            Self::WriteConfig => "write VM config",
            Self::Delete => "remove VM from cache",
        };
        f.write_str(name)
    }
}

/// Errors returned by a run.
///
/// Every variant aborts the run. Unlock failures never show up here; they are
/// logged as warnings during cleanup.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The host has no usable rootful machine.
    #[error("{0}")]
    HostConfiguration(String),

    /// The control-plane connection could not be opened.
    #[error("failed to connect to {uri}: {source}")]
    Connectivity {
        uri: String,
        #[source]
        source: BoxError,
    },

    /// The disk image collaborator failed.
    #[error("unable to install bootc image {image}: {source}")]
    ImageInstall {
        image: String,
        #[source]
        source: BoxError,
    },

    /// No free local port could be reserved for SSH.
    #[error("unable to get free port for SSH: {0}")]
    ResourceAllocation(#[source] std::io::Error),

    /// The VM handle could not be created or locked.
    #[error("unable to initialize VM: {0}")]
    VmInit(#[source] BoxError),

    /// A step after VM creation failed.
    #[error("{step}: {source}")]
    Runtime {
        step: RuntimeStep,
        #[source]
        source: BoxError,
    },

    /// The SSH endpoint did not become ready in time.
    #[error("timed out after {timeout:?} waiting for SSH on port {port}")]
    ReadinessTimeout { port: u16, timeout: Duration },

    /// The remote session could not be executed.
    #[error("ssh: {0}")]
    SshExec(#[source] BoxError),

    /// The run options are inconsistent.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// A host path was expected but is missing.
    #[error("path does not exist: {}", .0.display())]
    MissingPath(PathBuf),
}

impl Error {
    pub(crate) fn runtime(step: RuntimeStep, source: impl Into<BoxError>) -> Self {
        Self::Runtime {
            step,
            source: source.into(),
        }
    }

    /// Whether the CLI should print the host setup hint before this error.
    pub fn needs_host_hint(&self) -> bool {
        matches!(self, Self::HostConfiguration(_) | Self::Connectivity { .. })
    }
}

impl From<LockError> for Error {
    fn from(err: LockError) -> Self {
        Self::VmInit(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
