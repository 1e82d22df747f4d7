use tracing_subscriber::EnvFilter;

/// Initialise tracing for the host process. The `DISTIL_LOG` env var takes
/// precedence over the configured level. Safe to call more than once; only
/// the first call wins.
pub fn init(default_level: Option<&str>) {
    let filter = EnvFilter::try_from_env("DISTIL_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level.unwrap_or("info")));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
