//! Host-wide reservation of local TCP ports.
//!
//! Binding `127.0.0.1:0` only guarantees the port is free at that instant;
//! once the listener is dropped another process may receive the same port.
//! Each candidate is therefore claimed with a `flock(2)` on
//! `<dir>/port-<n>.lock`, held until the [`PortReservation`] is dropped.
//! Allocators in other processes skip ports whose lock they cannot take.

use std::fs::{File, OpenOptions};
use std::io;
use std::net::{Ipv4Addr, TcpListener};
use std::path::PathBuf;

use tracing::debug;

use crate::backend::PortAllocator;
use crate::lock::flock;

const MAX_ATTEMPTS: usize = 32;

/// A reserved local port.
#[derive(Debug)]
pub struct PortReservation {
    port: u16,
    _claim: Option<File>,
}

impl PortReservation {
    /// A reservation with no host-wide claim behind it.
    pub fn unclaimed(port: u16) -> Self {
        Self { port, _claim: None }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Allocates loopback ports and claims them through lock files.
#[derive(Debug, Clone)]
pub struct LocalPortAllocator {
    claim_dir: PathBuf,
}

impl LocalPortAllocator {
    pub fn new(claim_dir: impl Into<PathBuf>) -> Self {
        Self {
            claim_dir: claim_dir.into(),
        }
    }

    fn try_claim(&self, port: u16) -> io::Result<Option<File>> {
        let path = self.claim_dir.join(format!("port-{port}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        match flock(&file, libc::LOCK_EX | libc::LOCK_NB) {
            Ok(()) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl PortAllocator for LocalPortAllocator {
    fn allocate(&self) -> io::Result<PortReservation> {
        std::fs::create_dir_all(&self.claim_dir)?;
        for _ in 0..MAX_ATTEMPTS {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
            let port = listener.local_addr()?.port();
            if let Some(claim) = self.try_claim(port)? {
                debug!(port, "reserved local port");
                return Ok(PortReservation {
                    port,
                    _claim: Some(claim),
                });
            }
            debug!(port, "port claimed by another process, retrying");
        }
        Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("no unclaimed local port after {MAX_ATTEMPTS} attempts"),
        ))
    }
}
