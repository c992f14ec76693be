//! Run bootc container images as local virtual machines.
//!
//! This crate re-exports the SDK:
//!
//! - [`sdk`]: run orchestration, collaborator traits and the default
//!   podman, `bootc`, QEMU and `ssh` backends
//!
//! # Quick Start
//!
//! ```no_run
//! use bootc_vm::sdk::{
//!     Backends, BootcDiskInstaller, LocalPortAllocator, LockDir, Paths, PodmanConnector,
//!     PodmanMachine, QemuHypervisor, RunOptions, Session,
//! };
//!
//! # async fn example() -> bootc_vm::sdk::Result<()> {
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
//! // Boot in the background and return once the VM is up.
//! let options = RunOptions::builder().background(true).build();
//! session
//!     .run("quay.io/centos-bootc/centos-bootc:stream9", &options, &[])
//!     .await?;
//! # Ok(())
//! # }
//! ```

/// Run orchestration and default backends.
///
/// This module provides:
/// - [`sdk::Session`]: Drives a run from image reference to SSH session
/// - [`sdk::RunOptions`]: Immutable per-run configuration
/// - [`sdk::backend`]: Collaborator traits for host, disk, ports and VMs
/// - [`sdk::qemu`]: QEMU-backed VMs
pub use bvm_sdk as sdk;
