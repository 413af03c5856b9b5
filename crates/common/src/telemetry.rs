use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber with JSON output.
///
/// `default_filter` applies when `RUST_LOG` is unset.
pub fn init_tracing(default_filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .json()
        .init();
}
