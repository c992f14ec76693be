//! Logging initialisation for the `bvm` binary.
//!
//! Logs go to stderr so they never interleave with the relayed VM console on
//! stdout. `RUST_LOG` takes precedence over `--verbose`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber. Call once from `main`.
pub fn init(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
