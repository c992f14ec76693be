//! QEMU process driver.
//!
//! Each image gets one VM whose state lives next to its disk:
//!
//! ```text
//! <cache>/<image-id>/vm/qemu.pid      pid of the daemonized QEMU
//! <cache>/<image-id>/vm/qmp.sock      QMP monitor (the backend connection)
//! <cache>/<image-id>/vm/console.sock  serial console
//! <cache>/<image-id>/vm/vm.json       persisted run configuration
//! ```
//!
//! QEMU is started with `-daemonize` so the VM outlives the invocation in
//! background mode.

use std::ffi::OsString;
use std::io::{self, Read};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::process::Command;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use crate::backend::{DiskImage, Hypervisor, RunVmParams, VirtualMachine};
use crate::error::BoxError;
use crate::ssh::{SshCommand, SshTarget, exit_code};

const VM_DIR: &str = "vm";
const PID_FILE: &str = "qemu.pid";
const QMP_SOCKET: &str = "qmp.sock";
const CONSOLE_SOCKET: &str = "console.sock";
const CONFIG_FILE: &str = "vm.json";

const QMP_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Hypervisor
// =============================================================================

/// Creates QEMU-backed VMs.
#[derive(Debug, Clone)]
pub struct QemuHypervisor {
    qemu_bin: PathBuf,
    ssh_bin: PathBuf,
    memory_mib: u32,
    vcpus: u32,
}

impl Default for QemuHypervisor {
    fn default() -> Self {
        Self {
            qemu_bin: PathBuf::from(format!("qemu-system-{}", std::env::consts::ARCH)),
            ssh_bin: PathBuf::from("ssh"),
            memory_mib: 2048,
            vcpus: 2,
        }
    }
}

impl QemuHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn qemu_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.qemu_bin = bin.into();
        self
    }

    pub fn ssh_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.ssh_bin = bin.into();
        self
    }

    /// Guest memory (MiB).
    pub fn memory_mib(mut self, memory_mib: u32) -> Self {
        self.memory_mib = memory_mib;
        self
    }

    pub fn vcpus(mut self, vcpus: u32) -> Self {
        self.vcpus = vcpus;
        self
    }
}

impl Hypervisor for QemuHypervisor {
    type Vm = QemuVm;

    fn create(&self, disk: &DiskImage) -> Result<QemuVm, BoxError> {
        if !disk.disk_path.exists() {
            return Err(format!("disk image {} does not exist", disk.disk_path.display()).into());
        }
        Ok(QemuVm {
            hypervisor: self.clone(),
            image_id: disk.image_id.clone(),
            disk_path: disk.disk_path.clone(),
            vm_dir: vm_dir(&disk.cache_dir),
            pid: None,
            qmp: None,
            ssh: None,
            cloud_init: false,
        })
    }
}

// =============================================================================
// VM
// =============================================================================

/// Persisted run configuration of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    pub image_id: String,
    pub image_ref: String,
    pub disk_path: PathBuf,
    pub ssh_port: u16,
    pub ssh_identity: PathBuf,
    pub vm_user: String,
    pub cloud_init: bool,
    pub pid: Option<u32>,
}

impl VmConfig {
    /// Load the configuration written for the VM in `vm_dir`.
    pub fn load(vm_dir: impl AsRef<Path>) -> io::Result<Self> {
        let bytes = std::fs::read(vm_dir.as_ref().join(CONFIG_FILE))?;
        serde_json::from_slice(&bytes).map_err(io::Error::from)
    }
}

/// A VM driven by a daemonized QEMU process.
#[derive(Debug)]
pub struct QemuVm {
    hypervisor: QemuHypervisor,
    image_id: String,
    disk_path: PathBuf,
    vm_dir: PathBuf,
    pid: Option<u32>,
    qmp: Option<Qmp>,
    ssh: Option<SshTarget>,
    cloud_init: bool,
}

impl QemuVm {
    pub fn vm_dir(&self) -> &Path {
        &self.vm_dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.vm_dir.join(name)
    }

    fn build_args(&self, params: &RunVmParams, authorized_key: Option<&str>) -> Vec<String> {
        let hv = &self.hypervisor;
        let mut args = vec![
            "-name".to_owned(),
            format!("bootc-{}", short_id(&self.image_id)),
        ];

        for accel in accelerators() {
            args.push("-accel".to_owned());
            args.push((*accel).to_owned());
        }

        args.extend([
            "-cpu".to_owned(),
            "max".to_owned(),
            "-m".to_owned(),
            hv.memory_mib.to_string(),
            "-smp".to_owned(),
            hv.vcpus.to_string(),
            "-drive".to_owned(),
            format!(
                "if=virtio,format=raw,file={}",
                escape_opt(&self.disk_path.display().to_string())
            ),
            "-netdev".to_owned(),
            format!(
                "user,id=net0,hostfwd=tcp:127.0.0.1:{}-:22",
                params.ssh_port
            ),
            "-device".to_owned(),
            "virtio-net-pci,netdev=net0".to_owned(),
            "-chardev".to_owned(),
            format!(
                "socket,id=console,path={},server=on,wait=off",
                escape_opt(&self.path(CONSOLE_SOCKET).display().to_string())
            ),
            "-serial".to_owned(),
            "chardev:console".to_owned(),
            "-qmp".to_owned(),
            format!(
                "unix:{},server=on,wait=off",
                escape_opt(&self.path(QMP_SOCKET).display().to_string())
            ),
            "-display".to_owned(),
            "none".to_owned(),
            "-daemonize".to_owned(),
            "-pidfile".to_owned(),
            self.path(PID_FILE).display().to_string(),
        ]);

        if let Some(key) = authorized_key {
            args.push("-smbios".to_owned());
            args.push(format!(
                "type=11,value=io.systemd.credential:ssh.authorized_keys.{}={}",
                params.vm_user,
                escape_opt(key.trim())
            ));
        }

        if let Some(dir) = &params.cloud_init_dir {
            args.push("-drive".to_owned());
            args.push(format!(
                "if=virtio,format=raw,readonly=on,file.driver=vvfat,file.dir={},file.label=cidata",
                escape_opt(&dir.display().to_string())
            ));
        }

        args
    }

}

impl VirtualMachine for QemuVm {
    async fn run(&mut self, params: &RunVmParams) -> Result<(), BoxError> {
        if let Some(pid) = running_pid(&self.vm_dir) {
            return Err(format!("VM for image {} is already running (pid {pid})", self.image_id).into());
        }

        tokio::fs::create_dir_all(&self.vm_dir).await?;
        for stale in [CONSOLE_SOCKET, QMP_SOCKET, PID_FILE] {
            tokio::fs::remove_file(self.path(stale)).await.ok();
        }

        let authorized_key = if params.no_credentials {
            None
        } else {
            let mut pub_key = OsString::from(params.ssh_identity.as_os_str());
            pub_key.push(".pub");
            Some(tokio::fs::read_to_string(PathBuf::from(pub_key)).await?)
        };

        let args = self.build_args(params, authorized_key.as_deref());
        debug!(qemu = %self.hypervisor.qemu_bin.display(), ?args, "starting QEMU");
        let output = Command::new(&self.hypervisor.qemu_bin)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("qemu exited with {}: {}", output.status, stderr.trim()).into());
        }

        self.pid = read_pid(&self.vm_dir);
        self.qmp = Some(Qmp::connect(&self.path(QMP_SOCKET)).await?);
        self.ssh = Some(SshTarget {
            user: params.vm_user.clone(),
            port: params.ssh_port,
            identity: params.ssh_identity.clone(),
        });
        self.cloud_init = params.cloud_init_data;
        info!(pid = ?self.pid, image_id = %self.image_id, "QEMU started");
        Ok(())
    }

    fn write_config(&self, disk: &DiskImage) -> Result<(), BoxError> {
        let ssh = self.ssh.as_ref().ok_or("VM has not been started")?;
        let config = VmConfig {
            image_id: disk.image_id.clone(),
            image_ref: disk.image_ref.clone(),
            disk_path: disk.disk_path.clone(),
            ssh_port: ssh.port,
            ssh_identity: ssh.identity.clone(),
            vm_user: ssh.user.clone(),
            cloud_init: self.cloud_init,
            pid: self.pid,
        };
        std::fs::write(self.path(CONFIG_FILE), serde_json::to_vec_pretty(&config)?)?;
        Ok(())
    }

    fn console(&self) -> Result<Box<dyn Read + Send>, BoxError> {
        let stream = UnixStream::connect(self.path(CONSOLE_SOCKET))?;
        Ok(Box::new(stream))
    }

    async fn run_remote(&self, cmd: &[String]) -> Result<i32, BoxError> {
        let target = self.ssh.clone().ok_or("VM has not been started")?;
        let status = SshCommand::new(target)
            .ssh_bin(&self.hypervisor.ssh_bin)
            .status(cmd)
            .await?;
        Ok(exit_code(status))
    }

    async fn delete(&mut self) -> Result<(), BoxError> {
        let pid = self.pid.or_else(|| read_pid(&self.vm_dir));

        match self.qmp.as_mut() {
            Some(qmp) => {
                if let Err(e) = qmp.execute("quit").await {
                    // The monitor may close before replying.
                    debug!(error = %e, "QMP quit");
                }
            }
            None => {
                if let Some(pid) = pid {
                    signal(pid, libc::SIGTERM);
                }
            }
        }
        self.close_connection();

        if let Some(pid) = pid
            && !wait_for_exit(pid, STOP_TIMEOUT).await
        {
            warn!(pid, "QEMU did not exit, killing it");
            signal(pid, libc::SIGKILL);
        }
        self.pid = None;

        match tokio::fs::remove_dir_all(&self.vm_dir).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn close_connection(&mut self) {
        // Dropping both halves closes the monitor socket.
        self.qmp = None;
    }
}

// =============================================================================
// QMP
// =============================================================================

/// Minimal line-oriented QMP client.
#[derive(Debug)]
struct Qmp {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Qmp {
    async fn connect(path: &Path) -> io::Result<Self> {
        let stream = tokio::net::UnixStream::connect(path).await?;
        let (read, writer) = stream.into_split();
        let mut qmp = Self {
            reader: BufReader::new(read),
            writer,
        };

        let greeting = qmp.read_message().await?;
        if greeting.get("QMP").is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected QMP greeting",
            ));
        }
        qmp.execute("qmp_capabilities").await?;
        Ok(qmp)
    }

    async fn read_message(&mut self) -> io::Result<serde_json::Value> {
        let mut line = String::new();
        let n = timeout(QMP_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "QMP reply timed out"))??;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        serde_json::from_str(&line).map_err(io::Error::from)
    }

    async fn execute(&mut self, command: &str) -> io::Result<serde_json::Value> {
        let request = format!("{}\n", serde_json::json!({ "execute": command }));
        self.writer.write_all(request.as_bytes()).await?;
        loop {
            let mut msg = self.read_message().await?;
            if let Some(ret) = msg.get_mut("return") {
                return Ok(ret.take());
            }
            if let Some(err) = msg.get("error") {
                return Err(io::Error::other(format!("QMP {command}: {err}")));
            }
            // Asynchronous event, keep reading.
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn accelerators() -> &'static [&'static str] {
    if cfg!(target_os = "macos") {
        &["hvf", "tcg"]
    } else {
        &["kvm", "tcg"]
    }
}

fn short_id(image_id: &str) -> &str {
    image_id.get(..12).unwrap_or(image_id)
}

/// Per-VM state directory inside an image's cache directory.
pub(crate) fn vm_dir(cache_dir: &Path) -> PathBuf {
    cache_dir.join(VM_DIR)
}

fn read_pid(vm_dir: &Path) -> Option<u32> {
    std::fs::read_to_string(vm_dir.join(PID_FILE))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// Pid of a live QEMU recorded in `vm_dir`, if any.
pub(crate) fn running_pid(vm_dir: &Path) -> Option<u32> {
    read_pid(vm_dir).filter(|&pid| process_alive(pid))
}

/// Commas separate QEMU sub-options; a literal comma is written twice.
fn escape_opt(value: &str) -> String {
    value.replace(',', ",,")
}

fn signal(pid: u32, sig: libc::c_int) {
    // SAFETY: kill has no memory-safety preconditions.
    unsafe {
        libc::kill(pid as libc::pid_t, sig);
    }
}

fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence and permission.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while process_alive(pid) {
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(100)).await;
    }
    true
}

// =============================================================================
// Tests
// =============================================================================
