//! Set up `tracing` the same way across the worker binary and its tests.

use tracing_subscriber::EnvFilter;

/// Install a global `tracing` subscriber that honors `RUST_LOG`, falling back
/// to `info` for this crate and `warn` for everything else.
///
/// Safe to call more than once; only the first call takes effect.
pub fn initialize_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,moe_common=info,moe_worker=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
