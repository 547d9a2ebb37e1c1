//! Tracing initialisation for binaries embedding the engine

use tracing_subscriber::EnvFilter;

/// JSON logs filtered by `RUST_LOG` (default `info`).
///
/// Safe to call multiple times; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_is_harmless() {
        init();
        init();
        tracing::info!(component = "logging", "subscriber installed");
    }
}
