//! Run orchestration.
//!
//! A [`Session`] drives one run through a fixed sequence of steps:
//!
//! ```text
//! validate host → connect → install disk → allocate port → create + lock VM
//!     → run VM → write config ─┬─ background: done
//!                              └─ foreground: console ∥ wait for SSH
//!                                   → remote command → (delete VM)
//! ```
//!
//! Each step's failure aborts the run with an [`Error`] naming the step.
//! Once the VM handle exists it lives inside a [`CleanupGuard`], so the
//! connection is closed and the image unlocked on every exit path.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::backend::{
    Connector, DiskImageInstaller, HostProvider, Hypervisor, PortAllocator, RunVmParams,
    VirtualMachine,
};
use crate::cleanup::CleanupGuard;
use crate::console::{CONSOLE_SETTLE_DELAY, ConsoleTask};
use crate::error::{Error, Result, RuntimeStep};
use crate::host;
use crate::lock::{LockDir, LockMode};
use crate::options::RunOptions;
use crate::readiness::{self, DEFAULT_POLL_INTERVAL, DEFAULT_READY_TIMEOUT};
use crate::vm::VmHandle;

/// Produces the writer console output is relayed to.
pub type ConsoleSink = Arc<dyn Fn() -> Box<dyn Write + Send> + Send + Sync>;

/// How a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The VM was left running in the background.
    Detached,
    /// The remote session exited with this status.
    Remote(i32),
}

impl ExitOutcome {
    /// Process exit code for this outcome.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Detached => 0,
            Self::Remote(status) => status,
        }
    }
}

/// The collaborators a [`Session`] drives.
pub struct Backends<H, C, D, P, Y> {
    pub host: H,
    pub connector: C,
    pub installer: D,
    pub ports: P,
    pub hypervisor: Y,
}

/// Orchestrates a run against a set of [`Backends`].
pub struct Session<H, C, D, P, Y> {
    backends: Backends<H, C, D, P, Y>,
    locks: LockDir,
    ready_timeout: Duration,
    poll_interval: Duration,
    settle_delay: Duration,
    console_sink: ConsoleSink,
}

impl<H, C, D, P, Y> Session<H, C, D, P, Y>
where
    H: HostProvider,
    C: Connector,
    D: DiskImageInstaller<C::Connection>,
    P: PortAllocator,
    Y: Hypervisor,
{
    /// Create a session that locks images under `locks`.
    pub fn new(backends: Backends<H, C, D, P, Y>, locks: LockDir) -> Self {
        Self {
            backends,
            locks,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            settle_delay: CONSOLE_SETTLE_DELAY,
            console_sink: Arc::new(|| -> Box<dyn Write + Send> { Box::new(io::stdout()) }),
        }
    }

    /// Set how long to wait for the guest's SSH server.
    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Set the SSH polling interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the pause between readiness and the remote session when the
    /// console is relayed.
    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Relay console output somewhere other than stdout.
    pub fn console_sink(mut self, sink: ConsoleSink) -> Self {
        self.console_sink = sink;
        self
    }

    /// Run `image_ref` as a VM.
    ///
    /// With `options.background()` the run ends once the VM is booted.
    /// Otherwise it waits for SSH, runs `remote_cmd` (an interactive shell
    /// when empty) and returns its exit status. The VM is deleted afterwards
    /// when `--rm` was given or a command was run.
    pub async fn run(
        &self,
        image_ref: &str,
        options: &RunOptions,
        remote_cmd: &[String],
    ) -> Result<ExitOutcome> {
        options.validate(remote_cmd)?;

        let machine = self
            .backends
            .host
            .host_connection()
            .await
            .map_err(|e| Error::HostConfiguration(format!("unable to get machine info: {e}")))?;
        let host = host::validate(machine)?;

        let uri = host.socket_uri();
        debug!(%uri, "connecting to backend");
        let connection = self
            .backends
            .connector
            .connect(&uri, host.ssh_identity(), true)
            .await
            .map_err(|source| Error::Connectivity {
                uri: uri.clone(),
                source,
            })?;

        let disk = self
            .backends
            .installer
            .install(&connection, image_ref, options.disk(), options.quiet())
            .await
            .map_err(|source| Error::ImageInstall {
                image: image_ref.to_owned(),
                source,
            })?;
        info!(image = image_ref, image_id = %disk.image_id, "disk image ready");

        if !options.quiet() {
            println!("Booting the VM...");
        }
        let port = self
            .backends
            .ports
            .allocate()
            .map_err(Error::ResourceAllocation)?;

        let vm = self
            .backends
            .hypervisor
            .create(&disk)
            .map_err(Error::VmInit)?;
        let mut vm = CleanupGuard::new(VmHandle::new(&disk.image_id, vm, self.locks.clone()));
        // Shared: only a disk rebuild needs the image to itself.
        vm.lock(LockMode::Shared)?;

        let params = RunVmParams {
            cmd: remote_cmd.to_vec(),
            cloud_init_dir: options.cloud_init_dir().map(ToOwned::to_owned),
            cloud_init_data: options.cloud_init_dir().is_some(),
            no_credentials: options.no_credentials(),
            remove_vm: options.remove_vm(),
            background: options.background(),
            ssh_port: port.port(),
            ssh_identity: host.ssh_identity.clone(),
            vm_user: options.user().to_owned(),
        };
        vm.run(&params)
            .await
            .map_err(|e| Error::runtime(RuntimeStep::Run, e))?;
        info!(image_id = %disk.image_id, ssh_port = params.ssh_port, "VM started");

        vm.write_config(&disk)
            .map_err(|e| Error::runtime(RuntimeStep::WriteConfig, e))?;

        if options.background() {
            info!(image_id = %disk.image_id, "VM left running in the background");
            return Ok(ExitOutcome::Detached);
        }

        let status = self.attach(&*vm, &params, options.quiet()).await?;
        debug!(status, "remote session ended");

        if options.remove_vm() || !remote_cmd.is_empty() {
            vm.delete()
                .await
                .map_err(|e| Error::runtime(RuntimeStep::Delete, e))?;
            info!(image_id = %disk.image_id, "VM removed, disk image kept");
        }

        Ok(ExitOutcome::Remote(status))
    }

    async fn attach<V: VirtualMachine>(
        &self,
        vm: &VmHandle<V>,
        params: &RunVmParams,
        quiet: bool,
    ) -> Result<i32> {
        if quiet {
            readiness::wait_ready(params.ssh_port, self.ready_timeout, self.poll_interval).await?;
        } else {
            self.start_console(vm);
            readiness::wait_ready(params.ssh_port, self.ready_timeout, self.poll_interval).await?;
            sleep(self.settle_delay).await;
        }

        vm.run_remote(&params.cmd).await.map_err(Error::SshExec)
    }

    fn start_console<V: VirtualMachine>(&self, vm: &VmHandle<V>) {
        let started = vm
            .console()
            .and_then(|stream| Ok(ConsoleTask::start(stream, (self.console_sink)())?));
        match started {
            Ok(task) => task.detach(),
            Err(e) => error!(image_id = vm.image_id(), error = %e, "error printing VM console"),
        }
    }
}
