//! Tracing initialization.

use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber with env-filter support.
///
/// Reads `RUST_LOG` when set, otherwise defaults to `info` with the GPU layer
/// at `debug`. Safe to call once per process; later calls are ignored.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,wired_gpu=debug"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init();
}
