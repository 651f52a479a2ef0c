use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// The environment variable controlling the log output, using the [`EnvFilter`] directive syntax.
pub const LOG_ENV: &str = "KUBETYPES_CTL_LOG";

const DEFAULT_LEVEL: LevelFilter = LevelFilter::WARN;

/// Initializes `tracing` logging with options from the environment variable given in the `env`
/// parameter. Without that variable only warnings and errors are logged.
///
/// Log output goes to stderr, stdout is reserved for the printed objects.
pub fn initialize_logging(env: &str) {
    let fmt = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    Registry::default().with(env_filter(env)).with(fmt).init();
}

fn env_filter(env: &str) -> EnvFilter {
    EnvFilter::try_from_env(env).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL.to_string()))
}
