//! Orchestration scenarios driven through in-memory collaborators.
//!
//! Every fake appends to a shared event log so tests can check which steps
//! ran and in which order. SSH readiness is served by a local stub that
//! greets with an SSH banner and counts connections.

use std::io::{self, Read, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bvm_sdk::{
    Backends, BoxError, Connector, DiskImage, DiskImageConfig, DiskImageInstaller, Error,
    ExitOutcome, HostConnection, HostProvider, Hypervisor, LockDir, LockError, LockMode,
    PortAllocator, PortReservation, RunOptions, RunVmParams, RuntimeStep, Session,
    VirtualMachine,
};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

const IMAGE: &str = "quay.io/centos-bootc/centos-bootc:stream9";
const IMAGE_ID: &str = "4f3bd5a2c8e1";
const CONSOLE_OUTPUT: &[u8] = b"[  OK  ] Reached target multi-user.target\n";

// =============================================================================
// Event log
// =============================================================================

#[derive(Clone, Default)]
struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn has(&self, event: &str) -> bool {
        self.events().iter().any(|e| e == event)
    }

    fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }
}

// =============================================================================
// Fakes
// =============================================================================

struct FakeHost {
    log: Log,
    machine: Option<HostConnection>,
}

impl HostProvider for FakeHost {
    async fn host_connection(&self) -> Result<Option<HostConnection>, BoxError> {
        self.log.push("host");
        Ok(self.machine.clone())
    }
}

struct FakeConnector {
    log: Log,
}

impl Connector for FakeConnector {
    type Connection = ();

    async fn connect(&self, uri: &str, _identity: &Path, authenticated: bool) -> Result<(), BoxError> {
        assert!(uri.starts_with("unix://"));
        assert!(authenticated);
        self.log.push("connect");
        Ok(())
    }
}

struct FakeInstaller {
    log: Log,
    cache: PathBuf,
    fail: bool,
}

impl DiskImageInstaller<()> for FakeInstaller {
    async fn install(
        &self,
        _connection: &(),
        image_ref: &str,
        _config: &DiskImageConfig,
        _quiet: bool,
    ) -> Result<DiskImage, BoxError> {
        self.log.push("install");
        if self.fail {
            return Err("bootc install to-disk failed: exit status: 1".into());
        }
        let cache_dir = self.cache.join(IMAGE_ID);
        std::fs::create_dir_all(&cache_dir)?;
        let disk_path = cache_dir.join("disk.raw");
        std::fs::write(&disk_path, b"disk")?;
        Ok(DiskImage {
            image_id: IMAGE_ID.to_owned(),
            image_ref: image_ref.to_owned(),
            disk_path,
            cache_dir,
        })
    }
}

struct FakePorts {
    log: Log,
    port: Option<u16>,
}

impl PortAllocator for FakePorts {
    fn allocate(&self) -> io::Result<PortReservation> {
        self.log.push("allocate");
        match self.port {
            Some(port) => Ok(PortReservation::unclaimed(port)),
            None => Err(io::Error::new(io::ErrorKind::AddrInUse, "no free port")),
        }
    }
}

#[derive(Clone, Default)]
struct VmBehavior {
    run_fails: bool,
    write_config_fails: bool,
    console_fails: bool,
    remote_fails: bool,
    delete_fails: bool,
    remote_status: i32,
}

struct FakeHypervisor {
    log: Log,
    locks: LockDir,
    behavior: VmBehavior,
}

impl Hypervisor for FakeHypervisor {
    type Vm = FakeVm;

    fn create(&self, disk: &DiskImage) -> Result<FakeVm, BoxError> {
        self.log.push("create");
        Ok(FakeVm {
            log: self.log.clone(),
            locks: self.locks.clone(),
            image_id: disk.image_id.clone(),
            behavior: self.behavior.clone(),
            params: None,
        })
    }
}

struct FakeVm {
    log: Log,
    locks: LockDir,
    image_id: String,
    behavior: VmBehavior,
    params: Option<RunVmParams>,
}

impl VirtualMachine for FakeVm {
    async fn run(&mut self, params: &RunVmParams) -> Result<(), BoxError> {
        self.log.push("run");
        if self.behavior.run_fails {
            return Err("qemu exited with exit status: 1".into());
        }
        self.params = Some(params.clone());
        Ok(())
    }

    fn write_config(&self, disk: &DiskImage) -> Result<(), BoxError> {
        assert_eq!(disk.image_id, self.image_id);
        self.log.push("write_config");
        if self.behavior.write_config_fails {
            return Err("vm.json: read-only file system".into());
        }
        Ok(())
    }

    fn console(&self) -> Result<Box<dyn Read + Send>, BoxError> {
        self.log.push("console");
        if self.behavior.console_fails {
            return Err("console socket refused connection".into());
        }
        Ok(Box::new(io::Cursor::new(CONSOLE_OUTPUT)))
    }

    async fn run_remote(&self, cmd: &[String]) -> Result<i32, BoxError> {
        let params = self.params.as_ref().ok_or("VM has not been started")?;
        assert_eq!(params.cmd, cmd);
        assert_eq!(params.vm_user, "root");
        self.log.push(format!("remote:{}", cmd.join(" ")));
        if self.behavior.remote_fails {
            return Err("ssh: connection reset by peer".into());
        }
        Ok(self.behavior.remote_status)
    }

    async fn delete(&mut self) -> Result<(), BoxError> {
        self.log.push("delete");
        if self.behavior.delete_fails {
            return Err("QMP quit failed".into());
        }
        Ok(())
    }

    fn close_connection(&mut self) {
        // A second holder can take the lock only if it was already released.
        let held = match self.locks.try_lock(&self.image_id, LockMode::Exclusive) {
            Err(LockError::AlreadyLocked { .. }) => true,
            Ok(lock) => {
                lock.unlock().unwrap();
                false
            }
            Err(e) => panic!("unexpected lock error: {e}"),
        };
        self.log.push(if held { "close:locked" } else { "close:unlocked" });
    }
}

// =============================================================================
// Harness
// =============================================================================

#[derive(Clone, Copy)]
enum HostState {
    Missing,
    Rootless,
    NoSocket,
    Ready,
}

struct World {
    tmp: TempDir,
    log: Log,
    locks: LockDir,
    host: HostState,
    install_fails: bool,
    port: Option<u16>,
    vm: VmBehavior,
    console: SharedBuf,
}

type FakeSession = Session<FakeHost, FakeConnector, FakeInstaller, FakePorts, FakeHypervisor>;

impl World {
    fn new(port: u16) -> Self {
        let tmp = TempDir::new().unwrap();
        let locks = LockDir::new(tmp.path().join("locks"));
        std::fs::write(tmp.path().join("podman.sock"), b"").unwrap();
        Self {
            tmp,
            log: Log::default(),
            locks,
            host: HostState::Ready,
            install_fails: false,
            port: Some(port),
            vm: VmBehavior::default(),
            console: SharedBuf::default(),
        }
    }

    fn machine(&self) -> Option<HostConnection> {
        let socket_path = match self.host {
            HostState::Missing => return None,
            HostState::NoSocket => self.tmp.path().join("gone.sock"),
            HostState::Rootless | HostState::Ready => self.tmp.path().join("podman.sock"),
        };
        Some(HostConnection {
            socket_path,
            ssh_identity: self.tmp.path().join("machine"),
            rootful: !matches!(self.host, HostState::Rootless),
        })
    }

    fn session(&self) -> FakeSession {
        let console = self.console.clone();
        Session::new(
            Backends {
                host: FakeHost {
                    log: self.log.clone(),
                    machine: self.machine(),
                },
                connector: FakeConnector {
                    log: self.log.clone(),
                },
                installer: FakeInstaller {
                    log: self.log.clone(),
                    cache: self.tmp.path().join("cache"),
                    fail: self.install_fails,
                },
                ports: FakePorts {
                    log: self.log.clone(),
                    port: self.port,
                },
                hypervisor: FakeHypervisor {
                    log: self.log.clone(),
                    locks: self.locks.clone(),
                    behavior: self.vm.clone(),
                },
            },
            self.locks.clone(),
        )
        .ready_timeout(Duration::from_secs(5))
        .poll_interval(Duration::from_millis(10))
        .settle_delay(Duration::from_millis(50))
        .console_sink(Arc::new(move || -> Box<dyn Write + Send> {
            Box::new(console.clone())
        }))
    }

    fn assert_unlocked(&self) {
        let lock = self
            .locks
            .try_lock(IMAGE_ID, LockMode::Exclusive)
            .expect("image lock was not released");
        lock.unlock().unwrap();
    }
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    /// Wait for the detached relay thread to deliver `expected`.
    async fn wait_for(&self, expected: &[u8]) -> bool {
        for _ in 0..100 {
            if self.0.lock().unwrap().as_slice() == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

/// Local stand-in for a guest SSH server.
struct SshStub {
    port: u16,
    accepts: Arc<AtomicUsize>,
}

impl SshStub {
    async fn start() -> Self {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = accepts.clone();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = sock.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await;
            }
        });
        Self { port, accepts }
    }

    fn accepts(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }
}

/// A loopback port with nothing listening on it.
fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    listener.local_addr().unwrap().port()
}

fn cmd(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| (*s).to_owned()).collect()
}

// =============================================================================
// Host validation
// =============================================================================

#[tokio::test]
async fn test_missing_machine_fails_before_connect() {
    let mut world = World::new(closed_port());
    world.host = HostState::Missing;

    let err = world
        .session()
        .run(IMAGE, &RunOptions::default(), &[])
        .await
        .unwrap_err();

    assert!(matches!(err, Error::HostConfiguration(ref msg) if msg.contains("machine init --rootful")));
    assert!(err.needs_host_hint());
    assert_eq!(world.log.events(), ["host"]);
}

#[tokio::test]
async fn test_rootless_machine_fails_before_connect() {
    let mut world = World::new(closed_port());
    world.host = HostState::Rootless;

    let err = world
        .session()
        .run(IMAGE, &RunOptions::default(), &[])
        .await
        .unwrap_err();

    assert!(matches!(err, Error::HostConfiguration(ref msg) if msg.contains("machine set --rootful")));
    assert!(!world.log.has("connect"));
}

#[tokio::test]
async fn test_missing_socket_fails_before_connect() {
    let mut world = World::new(closed_port());
    world.host = HostState::NoSocket;

    let err = world
        .session()
        .run(IMAGE, &RunOptions::default(), &[])
        .await
        .unwrap_err();

    assert!(matches!(err, Error::HostConfiguration(ref msg) if msg.contains("gone.sock")));
    assert!(!world.log.has("connect"));
}

#[tokio::test]
async fn test_invalid_options_fail_before_host_lookup() {
    let world = World::new(closed_port());
    let options = RunOptions::builder()
        .remove_vm(true)
        .background(true)
        .build();

    let err = world.session().run(IMAGE, &options, &[]).await.unwrap_err();

    assert!(matches!(err, Error::InvalidOptions(_)));
    assert!(world.log.events().is_empty());
}

// =============================================================================
// Failures before the VM exists
// =============================================================================

#[tokio::test]
async fn test_install_failure_is_reported() {
    let mut world = World::new(closed_port());
    world.install_fails = true;

    let err = world
        .session()
        .run(IMAGE, &RunOptions::default(), &[])
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ImageInstall { ref image, .. } if image == IMAGE));
    assert!(!world.log.has("allocate"));
}

#[tokio::test]
async fn test_port_allocation_failure_never_creates_vm() {
    let mut world = World::new(closed_port());
    world.port = None;

    let err = world
        .session()
        .run(IMAGE, &RunOptions::default(), &[])
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ResourceAllocation(_)));
    assert_eq!(world.log.events(), ["host", "connect", "install", "allocate"]);
    world.assert_unlocked();
}

// =============================================================================
// Locking and cleanup
// =============================================================================

#[tokio::test]
async fn test_held_lock_fails_vm_init() {
    let world = World::new(closed_port());
    // A disk rebuild holds the image exclusively.
    let other = world.locks.try_lock(IMAGE_ID, LockMode::Exclusive).unwrap();

    let err = world
        .session()
        .run(IMAGE, &RunOptions::default(), &[])
        .await
        .unwrap_err();

    assert!(matches!(err, Error::VmInit(_)));
    assert!(!world.log.has("run"));
    // The guard still closed the connection; the other holder keeps its lock.
    assert_eq!(world.log.count("close:locked"), 1);
    other.unlock().unwrap();
    world.assert_unlocked();
}

#[tokio::test]
async fn test_run_failure_releases_lock() {
    let mut world = World::new(closed_port());
    world.vm.run_fails = true;

    let err = world
        .session()
        .run(IMAGE, &RunOptions::default(), &[])
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Runtime {
            step: RuntimeStep::Run,
            ..
        }
    ));
    assert!(!world.log.has("write_config"));
    assert_eq!(world.log.count("close:locked"), 1);
    world.assert_unlocked();
}

#[tokio::test]
async fn test_vm_lock_is_shared() {
    let world = World::new(closed_port());
    let other = world.locks.try_lock(IMAGE_ID, LockMode::Shared).unwrap();
    let options = RunOptions::builder().background(true).build();

    let outcome = world.session().run(IMAGE, &options, &[]).await.unwrap();

    assert_eq!(outcome, ExitOutcome::Detached);
    other.unlock().unwrap();
    world.assert_unlocked();
}

#[tokio::test]
async fn test_write_config_failure_releases_lock() {
    let ssh = SshStub::start().await;
    let mut world = World::new(ssh.port);
    world.vm.write_config_fails = true;

    let err = world
        .session()
        .run(IMAGE, &RunOptions::default(), &cmd(&["true"]))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Runtime {
            step: RuntimeStep::WriteConfig,
            ..
        }
    ));
    assert!(world.log.has("run"));
    assert!(!world.log.has("console"));
    assert!(!world.log.events().iter().any(|e| e.starts_with("remote:")));
    assert!(!world.log.has("delete"));
    assert_eq!(ssh.accepts(), 0);
    assert_eq!(world.log.count("close:locked"), 1);
    world.assert_unlocked();
}

#[tokio::test]
async fn test_remote_command_failure_releases_lock() {
    let ssh = SshStub::start().await;
    let mut world = World::new(ssh.port);
    world.vm.remote_fails = true;
    let options = RunOptions::builder().quiet(true).build();

    let err = world
        .session()
        .run(IMAGE, &options, &cmd(&["true"]))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::SshExec(_)));
    assert!(world.log.has("remote:true"));
    assert!(ssh.accepts() >= 1);
    // The VM is only deleted after a command completes.
    assert!(!world.log.has("delete"));
    assert_eq!(world.log.count("close:locked"), 1);
    world.assert_unlocked();
}

#[tokio::test]
async fn test_readiness_timeout_releases_lock() {
    let world = World::new(closed_port());
    let session = world.session().ready_timeout(Duration::from_millis(200));
    let options = RunOptions::builder().quiet(true).build();

    let err = session.run(IMAGE, &options, &[]).await.unwrap_err();

    assert!(matches!(err, Error::ReadinessTimeout { .. }));
    assert!(!world.log.events().iter().any(|e| e.starts_with("remote:")));
    assert!(!world.log.has("delete"));
    assert_eq!(world.log.count("close:locked"), 1);
    world.assert_unlocked();
}

#[tokio::test]
async fn test_delete_failure_is_reported_and_lock_released() {
    let ssh = SshStub::start().await;
    let mut world = World::new(ssh.port);
    world.vm.delete_fails = true;
    let options = RunOptions::builder().quiet(true).build();

    let err = world
        .session()
        .run(IMAGE, &options, &cmd(&["true"]))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Runtime {
            step: RuntimeStep::Delete,
            ..
        }
    ));
    world.assert_unlocked();
}

#[tokio::test]
async fn test_connection_closed_while_lock_held() {
    let ssh = SshStub::start().await;
    let world = World::new(ssh.port);
    let options = RunOptions::builder().quiet(true).build();

    world.session().run(IMAGE, &options, &[]).await.unwrap();

    assert_eq!(world.log.count("close:locked"), 1);
    assert!(!world.log.has("close:unlocked"));
    world.assert_unlocked();
}

// =============================================================================
// Scenarios
// =============================================================================

/// Interactive run: console relayed, SSH awaited, settle delay observed.
#[tokio::test]
async fn test_interactive_session() {
    let ssh = SshStub::start().await;
    let world = World::new(ssh.port);
    let settle = Duration::from_millis(200);
    let session = world.session().settle_delay(settle);

    let started = Instant::now();
    let outcome = session.run(IMAGE, &RunOptions::default(), &[]).await.unwrap();

    assert_eq!(outcome, ExitOutcome::Remote(0));
    assert_eq!(outcome.exit_code(), 0);
    assert!(started.elapsed() >= settle);
    assert!(ssh.accepts() >= 1);

    let console = world.log.position("console").unwrap();
    let remote = world.log.position("remote:").unwrap();
    assert!(world.log.position("write_config").unwrap() < console);
    assert!(console < remote);
    // No command and no --rm: the VM stays for the next session.
    assert!(!world.log.has("delete"));
    assert!(world.console.wait_for(CONSOLE_OUTPUT).await);
    world.assert_unlocked();
}

/// Background run: no console, no readiness, VM left in place.
#[tokio::test]
async fn test_background_run_detaches() {
    let ssh = SshStub::start().await;
    let world = World::new(ssh.port);
    let options = RunOptions::builder().background(true).build();

    let outcome = world.session().run(IMAGE, &options, &[]).await.unwrap();

    assert_eq!(outcome, ExitOutcome::Detached);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(ssh.accepts(), 0);
    assert!(!world.log.has("console"));
    assert!(!world.log.has("delete"));
    assert!(world.log.has("write_config"));
    world.assert_unlocked();
}

#[tokio::test]
async fn test_no_credentials_runs_in_background() {
    let ssh = SshStub::start().await;
    let world = World::new(ssh.port);
    let options = RunOptions::builder().no_credentials(true).build();

    let outcome = world.session().run(IMAGE, &options, &[]).await.unwrap();

    assert_eq!(outcome, ExitOutcome::Detached);
    assert_eq!(ssh.accepts(), 0);
}

/// A command runs, its status is returned and the VM is deleted.
#[tokio::test]
async fn test_command_deletes_vm() {
    let ssh = SshStub::start().await;
    let mut world = World::new(ssh.port);
    world.vm.remote_status = 3;
    let options = RunOptions::builder().quiet(true).build();

    let outcome = world
        .session()
        .run(IMAGE, &options, &cmd(&["systemctl", "is-system-running"]))
        .await
        .unwrap();

    assert_eq!(outcome.exit_code(), 3);
    assert!(world.log.has("remote:systemctl is-system-running"));
    let delete = world.log.position("delete").unwrap();
    let close = world.log.position("close:locked").unwrap();
    assert!(delete < close);
    assert!(world.tmp.path().join("cache").join(IMAGE_ID).join("disk.raw").exists());
}

#[tokio::test]
async fn test_rm_deletes_vm_after_shell() {
    let ssh = SshStub::start().await;
    let world = World::new(ssh.port);
    let options = RunOptions::builder().remove_vm(true).quiet(true).build();

    world.session().run(IMAGE, &options, &[]).await.unwrap();

    assert!(world.log.has("remote:"));
    assert!(world.log.has("delete"));
}

#[tokio::test]
async fn test_quiet_skips_console_but_waits_for_ssh() {
    let ssh = SshStub::start().await;
    let world = World::new(ssh.port);
    let options = RunOptions::builder().quiet(true).build();

    world.session().run(IMAGE, &options, &[]).await.unwrap();

    assert!(!world.log.has("console"));
    assert!(ssh.accepts() >= 1);
}

#[tokio::test]
async fn test_console_failure_is_not_fatal() {
    let ssh = SshStub::start().await;
    let mut world = World::new(ssh.port);
    world.vm.console_fails = true;

    let outcome = world
        .session()
        .run(IMAGE, &RunOptions::default(), &[])
        .await
        .unwrap();

    assert_eq!(outcome, ExitOutcome::Remote(0));
    assert!(world.log.has("console"));
    assert!(world.log.has("remote:"));
}
