//! Run bootc container images as local virtual machines.
//!
//! A [`Session`] takes an image reference, turns it into a bootable disk
//! inside a rootful podman machine, boots it and attaches an SSH session.
//! Every external system is reached through a collaborator trait in
//! [`backend`]; the crate ships default implementations:
//!
//! - [`podman::PodmanMachine`] / [`podman::PodmanConnector`]: host discovery
//!   and the podman REST API
//! - [`disk::BootcDiskInstaller`]: `bootc install to-disk`
//! - [`port::LocalPortAllocator`]: loopback port reservation
//! - [`qemu::QemuHypervisor`]: daemonized QEMU with user networking
//!
//! # Quick Start
//!
//! ```no_run
//! use bvm_sdk::{
//!     Backends, BootcDiskInstaller, LocalPortAllocator, LockDir, Paths, PodmanConnector,
//!     PodmanMachine, QemuHypervisor, RunOptions, Session,
//! };
//!
//! # async fn example() -> bvm_sdk::Result<()> {
//! let paths = Paths::from_env();
//! let locks = LockDir::new(paths.lock_dir());
//! let session = Session::new(
//!     Backends {
//!         host: PodmanMachine::new(),
//!         connector: PodmanConnector,
//!         installer: BootcDiskInstaller::new(paths.cache_dir(), locks.clone()),
//!         ports: LocalPortAllocator::new(paths.port_dir()),
//!         hypervisor: QemuHypervisor::new(),
//!     },
//!     locks,
//! );
//!
//! let options = RunOptions::builder().user("core").build();
//! let outcome = session
//!     .run("quay.io/fedora/fedora-bootc:41", &options, &[])
//!     .await?;
//! std::process::exit(outcome.exit_code());
//! # }
//! ```

pub mod backend;
pub mod cleanup;
pub mod console;
pub mod disk;
pub mod error;
pub mod host;
pub mod lock;
pub mod options;
pub mod paths;
pub mod podman;
pub mod port;
pub mod qemu;
pub mod readiness;
pub mod session;
pub mod ssh;
pub mod vm;

pub use backend::{
    Connector, DiskImage, DiskImageInstaller, HostProvider, Hypervisor, PortAllocator,
    RunVmParams, VirtualMachine,
};
pub use cleanup::{CleanupGuard, Release};
pub use disk::BootcDiskInstaller;
pub use error::{BoxError, Error, Result, RuntimeStep};
pub use host::{HOST_SETUP_HINT, HostConnection};
pub use lock::{ImageLock, LockDir, LockError, LockMode};
pub use options::{ByteSize, DiskImageConfig, ParseSizeError, RunOptions, RunOptionsBuilder};
pub use paths::Paths;
pub use podman::{PodmanConnection, PodmanConnector, PodmanMachine};
pub use port::{LocalPortAllocator, PortReservation};
pub use qemu::{QemuHypervisor, QemuVm, VmConfig};
pub use session::{Backends, ConsoleSink, ExitOutcome, Session};
pub use vm::VmHandle;
