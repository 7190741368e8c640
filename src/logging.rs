use tracing_subscriber::EnvFilter;

/// Variable holding the log filter, `RUST_LOG` is read when it is unset
pub const LOG_FILTER_VAR: &str = "STOREFRONT_LOG";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_FILTER_VAR)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Logs go to stderr so command output stays on stdout.
///
/// Does nothing if a subscriber is already installed.
pub fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}
