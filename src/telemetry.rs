//! Logging initialization
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is the host's call. Binaries and tests that want console output can use
//! [`init`], which reads the level from `VDB_LOG_LEVEL` and defaults to
//! `info`.

use tracing_subscriber::EnvFilter;

/// Install a formatting subscriber honoring `VDB_LOG_LEVEL`. Safe to call
/// more than once; only the first call installs anything.
pub fn init() {
    let filter = EnvFilter::try_from_env("VDB_LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
