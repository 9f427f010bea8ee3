//! Tracing initialization shared by the binaries.

use tracing_subscriber::EnvFilter;

/// Initializes the global subscriber.
///
/// `level` overrides the default; `RUST_LOG` wins when set. Safe to call
/// once per process.
pub fn init(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
