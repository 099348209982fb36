//! Tracing setup for binaries, demos and tests

use tracing_subscriber::EnvFilter;

/// Install a global `fmt` subscriber filtered by `RUST_LOG`
///
/// Falls back to `default_directive` (e.g. `"coherent_cache=info"`) when
/// `RUST_LOG` is unset or invalid. Calling it again is harmless: the first
/// installed subscriber stays.
pub fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
