//! Relays the VM console to the user while the session proceeds.
//!
//! Console reads block until the guest writes something and there is no way
//! to interrupt them, so the relay runs on its own OS thread rather than a
//! tokio task (a blocked `spawn_blocking` task would stall runtime
//! shutdown). The thread is never joined by the session; it ends when the
//! stream does or when the process exits.

use std::io::{self, Read, Write};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error};

/// Pause between confirmed readiness and the interactive session, so that
/// buffered console output lands before the remote prompt.
pub const CONSOLE_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// A running console relay.
pub struct ConsoleTask {
    handle: JoinHandle<io::Result<u64>>,
}

impl ConsoleTask {
    /// Start relaying `reader` into `writer`.
    pub fn start<R, W>(reader: R, writer: W) -> io::Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name("vm-console".to_owned())
            .spawn(move || relay(reader, writer))?;
        Ok(Self { handle })
    }

    /// Block until the stream ends and return the number of bytes relayed.
    pub fn join(self) -> io::Result<u64> {
        self.handle
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("console relay panicked")))
    }

    /// Let the relay run unsupervised until the stream ends or the process
    /// exits.
    pub fn detach(self) {
        drop(self.handle);
    }
}

fn relay<R: Read, W: Write>(mut reader: R, mut writer: W) -> io::Result<u64> {
    let mut buf = [0u8; 4096];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "error printing VM console");
                return Err(e);
            }
        };
        // Flush per chunk; the relay can be cut off by process exit at any
        // point.
        if let Err(e) = writer.write_all(&buf[..n]).and_then(|()| writer.flush()) {
            error!(error = %e, "error printing VM console");
            return Err(e);
        }
        total += n as u64;
    }
    debug!(bytes = total, "VM console stream ended");
    Ok(total)
}
