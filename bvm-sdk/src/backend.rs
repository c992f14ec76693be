//! Collaborator contracts.
//!
//! The [`Session`](crate::Session) is generic over these traits. The crate
//! ships default implementations (podman, `bootc install`, QEMU, `ssh`), and
//! tests drive the session with in-memory fakes.

use std::future::Future;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::BoxError;
use crate::host::HostConnection;
use crate::options::DiskImageConfig;
use crate::port::PortReservation;

/// Discovers the host's control-plane machine.
pub trait HostProvider {
    /// Returns `None` when no machine is configured at all.
    fn host_connection(
        &self,
    ) -> impl Future<Output = Result<Option<HostConnection>, BoxError>> + Send;
}

/// Opens control-plane connections.
pub trait Connector {
    type Connection: Send + Sync;

    fn connect(
        &self,
        uri: &str,
        identity: &Path,
        authenticated: bool,
    ) -> impl Future<Output = Result<Self::Connection, BoxError>> + Send;
}

/// Turns an image reference into a bootable disk image.
pub trait DiskImageInstaller<C> {
    fn install(
        &self,
        connection: &C,
        image_ref: &str,
        config: &DiskImageConfig,
        quiet: bool,
    ) -> impl Future<Output = Result<DiskImage, BoxError>> + Send;
}

/// Reserves free local TCP ports.
pub trait PortAllocator {
    fn allocate(&self) -> io::Result<PortReservation>;
}

/// Creates VMs for installed disk images.
pub trait Hypervisor {
    type Vm: VirtualMachine;

    fn create(&self, disk: &DiskImage) -> Result<Self::Vm, BoxError>;
}

/// A VM resource and its open backend connection.
pub trait VirtualMachine: Send {
    /// Boot the VM.
    fn run(&mut self, params: &RunVmParams)
    -> impl Future<Output = Result<(), BoxError>> + Send;

    /// Persist the run configuration next to the VM.
    fn write_config(&self, disk: &DiskImage) -> Result<(), BoxError>;

    /// Open the console output stream.
    ///
    /// Reads block until output arrives and cannot be interrupted.
    fn console(&self) -> Result<Box<dyn Read + Send>, BoxError>;

    /// Run `cmd` over SSH, or an interactive shell when empty, and return
    /// its exit status.
    fn run_remote(&self, cmd: &[String]) -> impl Future<Output = Result<i32, BoxError>> + Send;

    /// Remove the VM. The disk image is kept.
    fn delete(&mut self) -> impl Future<Output = Result<(), BoxError>> + Send;

    /// Close the backend connection. Must be idempotent.
    fn close_connection(&mut self);
}

/// An installed disk image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskImage {
    /// Identifier of the source image; keys the VM lock.
    pub image_id: String,
    /// Reference the image was installed from.
    pub image_ref: String,
    /// Path of the raw disk.
    pub disk_path: PathBuf,
    /// Directory holding the disk and per-VM state.
    pub cache_dir: PathBuf,
}

/// Per-run parameters handed to [`VirtualMachine::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunVmParams {
    pub cmd: Vec<String>,
    pub cloud_init_dir: Option<PathBuf>,
    pub cloud_init_data: bool,
    pub no_credentials: bool,
    pub remove_vm: bool,
    pub background: bool,
    pub ssh_port: u16,
    pub ssh_identity: PathBuf,
    pub vm_user: String,
}
