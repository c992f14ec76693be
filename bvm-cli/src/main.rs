use std::path::PathBuf;

use bootc_vm::sdk::{
    Backends, BootcDiskInstaller, ByteSize, HOST_SETUP_HINT, LocalPortAllocator, LockDir, Paths,
    PodmanConnector, PodmanMachine, QemuHypervisor, RunOptions, Session,
};
use clap::{Args, Parser, Subcommand};
use tracing::debug;

mod logging;

#[derive(Debug, Parser)]
#[command(
    name = "bvm",
    version,
    about = "Run bootc container images as local virtual machines"
)]
struct Cli {
    /// Log progress to stderr (overridden by `RUST_LOG`).
    #[arg(long, short, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Boot an image as a VM and open an SSH session or run a command.
    Run(RunArgs),
}

#[derive(Debug, Clone, Args)]
struct RunArgs {
    /// User to log in as inside the VM.
    #[arg(long, short, default_value = "root")]
    user: String,

    /// Directory with cloud-init data, attached as a `cidata` drive.
    #[arg(long = "cloudinit", value_name = "DIR")]
    cloud_init: Option<PathBuf>,

    /// Root filesystem type (e.g. xfs, btrfs, ext4).
    #[arg(long)]
    filesystem: Option<String>,

    /// Maximum root filesystem size, e.g. `8G`.
    #[arg(long, value_name = "SIZE")]
    root_size_max: Option<ByteSize>,

    /// Disk image size, e.g. `20G`.
    #[arg(long, value_name = "SIZE")]
    disk_size: Option<ByteSize>,

    /// Do not inject SSH credentials (implies `--background`).
    #[arg(long, default_value_t = false)]
    no_creds: bool,

    /// Leave the VM running and return once it has booted.
    #[arg(long, short = 'B', default_value_t = false)]
    background: bool,

    /// Remove the VM when the session ends.
    #[arg(long, default_value_t = false)]
    rm: bool,

    /// Suppress progress output and the VM console.
    #[arg(long, default_value_t = false)]
    quiet: bool,

    /// Image reference, e.g. `quay.io/centos-bootc/centos-bootc:stream9`.
    image: String,

    /// Command to run in the VM instead of an interactive shell.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let code = match cli.command {
        Commands::Run(args) => run(args).await,
    };
    std::process::exit(code);
}

async fn run(args: RunArgs) -> i32 {
    let options = build_run_options(&args);
    let paths = Paths::from_env();
    debug!(
        image = %args.image,
        cache = %paths.cache_dir().display(),
        runtime = %paths.runtime_dir().display(),
        "starting run"
    );
    let locks = LockDir::new(paths.lock_dir());
    let session = Session::new(
        Backends {
            host: PodmanMachine::new(),
            connector: PodmanConnector,
            installer: BootcDiskInstaller::new(paths.cache_dir(), locks.clone()),
            ports: LocalPortAllocator::new(paths.port_dir()),
            hypervisor: QemuHypervisor::new(),
        },
        locks,
    );

    match session.run(&args.image, &options, &args.command).await {
        Ok(outcome) => outcome.exit_code(),
        Err(e) => {
            if e.needs_host_hint() {
                eprintln!("{HOST_SETUP_HINT}\n");
            }
            eprintln!("Error: {e}");
            1
        }
    }
}

fn build_run_options(args: &RunArgs) -> RunOptions {
    let mut builder = RunOptions::builder()
        .user(args.user.clone())
        .background(args.background)
        .no_credentials(args.no_creds)
        .remove_vm(args.rm)
        .quiet(args.quiet);

    if let Some(dir) = &args.cloud_init {
        builder = builder.cloud_init_dir(dir.clone());
    }
    if let Some(fs) = &args.filesystem {
        builder = builder.filesystem(fs.clone());
    }
    if let Some(size) = args.root_size_max {
        builder = builder.root_size_max(size);
    }
    if let Some(size) = args.disk_size {
        builder = builder.disk_size(size);
    }

    builder.build()
}
