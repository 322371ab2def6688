//! Tracing bootstrap for gateway binaries and tests.

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Filter comes from `RUST_LOG`, defaulting to `info` for the gateway
/// crates. Safe to call once at process startup; later calls are ignored
/// (the subscriber can only be set once).
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pushgate_core=info,pushgate_server=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
