use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Printed before host configuration and connectivity errors.
pub const HOST_SETUP_HINT: &str = "\
******************************************************************
**** A rootful podman machine is required to run bootc images ****
******************************************************************
Create one with `podman machine init --rootful --now`, or switch an
existing machine with `podman machine set --rootful` and restart it.";

/// Control-plane endpoint of the host machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConnection {
    pub socket_path: PathBuf,
    pub ssh_identity: PathBuf,
    pub rootful: bool,
}

impl HostConnection {
    /// URI of the control-plane socket.
    pub fn socket_uri(&self) -> String {
        format!("unix://{}", self.socket_path.display())
    }

    pub fn ssh_identity(&self) -> &Path {
        &self.ssh_identity
    }
}

/// Check that a discovered machine can host VMs.
///
/// Requires a machine, rootful mode and an existing socket, in that order.
pub fn validate(machine: Option<HostConnection>) -> Result<HostConnection> {
    let Some(machine) = machine else {
        return Err(Error::HostConfiguration(
            "rootful podman machine is required, please run 'podman machine init --rootful'"
                .into(),
        ));
    };
    if !machine.rootful {
        return Err(Error::HostConfiguration(
            "rootful podman machine is required, please run 'podman machine set --rootful'".into(),
        ));
    }
    if let Err(e) = std::fs::metadata(&machine.socket_path) {
        return Err(Error::HostConfiguration(format!(
            "podman machine socket {} is missing, is the machine running? ({e})",
            machine.socket_path.display()
        )));
    }
    Ok(machine)
}
