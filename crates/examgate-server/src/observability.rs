//! Process-wide tracing subscriber.

use examgate_config::{LogFormat, LoggingConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// `RUST_LOG` when set and valid, otherwise the configured level.
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber in the configured format.
///
/// Returns `false` when a subscriber was already installed (tests, or a
/// second call); the existing one is kept.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let registry = tracing_subscriber::registry().with(env_filter(&config.level));
    let installed = match config.format {
        LogFormat::Text => registry.with(fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().flatten_event(true))
            .try_init(),
    };
    installed.is_ok()
}
