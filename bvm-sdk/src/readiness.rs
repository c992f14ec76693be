//! SSH readiness polling.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout as tokio_timeout};
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Default time to wait for the guest's SSH server.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(300);

/// Default interval between connection attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

const BANNER_TIMEOUT: Duration = Duration::from_secs(2);

/// Wait until `127.0.0.1:<port>` accepts a connection and greets with an SSH
/// identification string.
///
/// A bare TCP accept is not enough: user-mode networking accepts forwarded
/// connections before the guest is listening, then closes them.
pub async fn wait_ready(port: u16, timeout: Duration, poll_interval: Duration) -> Result<()> {
    debug!(port, ?timeout, "waiting for SSH");
    tokio_timeout(timeout, async {
        loop {
            if banner_ready(port).await {
                debug!(port, "SSH is ready");
                return;
            }
            sleep(poll_interval).await;
        }
    })
    .await
    .map_err(|_| Error::ReadinessTimeout { port, timeout })
}

async fn banner_ready(port: u16) -> bool {
    let mut stream = match TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await {
        Ok(stream) => stream,
        Err(e) => {
            trace!(port, error = %e, "SSH connect failed");
            return false;
        }
    };

    let mut banner = [0u8; 4];
    match tokio_timeout(BANNER_TIMEOUT, stream.read_exact(&mut banner)).await {
        Ok(Ok(_)) => &banner == b"SSH-",
        _ => false,
    }
}
