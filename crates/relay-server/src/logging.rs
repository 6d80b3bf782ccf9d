use tracing_subscriber::EnvFilter;

/// Initialize tracing from `RUST_LOG` when set, falling back to the
/// configured level.
pub fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_lowercase()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
