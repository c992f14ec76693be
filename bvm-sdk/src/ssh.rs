//! Remote sessions through the system `ssh(1)` client.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitStatus;

use tokio::process::Command;
use tracing::debug;

/// Where and as whom to log in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: String,
    pub port: u16,
    pub identity: PathBuf,
}

/// Builds and runs `ssh` invocations against a forwarded guest port.
#[derive(Debug, Clone)]
pub struct SshCommand {
    ssh_bin: PathBuf,
    target: SshTarget,
    tty: bool,
}

impl SshCommand {
    pub fn new(target: SshTarget) -> Self {
        Self {
            ssh_bin: PathBuf::from("ssh"),
            target,
            tty: std::io::stdin().is_terminal(),
        }
    }

    pub fn ssh_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.ssh_bin = bin.into();
        self
    }

    /// Force or suppress pseudo-terminal allocation.
    pub fn tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    fn build_args(&self, cmd: &[String]) -> Vec<String> {
        let mut args = vec![
            "-i".to_owned(),
            self.target.identity.display().to_string(),
            "-p".to_owned(),
            self.target.port.to_string(),
        ];
        for opt in [
            "IdentitiesOnly=yes",
            "StrictHostKeyChecking=no",
            "UserKnownHostsFile=/dev/null",
            "LogLevel=ERROR",
        ] {
            args.push("-o".to_owned());
            args.push(opt.to_owned());
        }
        if self.tty {
            args.push("-t".to_owned());
        }
        args.push(format!("{}@127.0.0.1", self.target.user));
        if !cmd.is_empty() {
            args.push("--".to_owned());
            args.extend(cmd.iter().cloned());
        }
        args
    }

    /// Run `cmd`, or an interactive shell when empty, with inherited stdio.
    pub async fn status(&self, cmd: &[String]) -> std::io::Result<ExitStatus> {
        let args = self.build_args(cmd);
        debug!(port = self.target.port, user = %self.target.user, ?cmd, "running ssh");
        Command::new(&self.ssh_bin).args(args).status().await
    }
}

/// Exit code for a finished process, mapping signals to `128 + signo`.
pub fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}
