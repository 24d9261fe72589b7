//! Logging setup
//!
//! The runtime only emits `tracing` events; it never installs a subscriber
//! on its own. Programs that have no subscriber of their own can call
//! [`init_logging`] to get formatted output on stderr, filtered by `COIL_LOG`
//! (same syntax as `RUST_LOG`, e.g. `COIL_LOG=coil=debug`).

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "COIL_LOG";

/// Install a stderr subscriber filtered by `COIL_LOG` (default `warn`).
///
/// Returns `false` if a global subscriber was already installed, in which
/// case nothing changes.
pub fn init_logging() -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .try_init()
        .is_ok()
}
