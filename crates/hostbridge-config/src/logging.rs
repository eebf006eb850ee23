//! Tracing subscriber setup

use crate::{ConfigError, LogFormat, LoggingConfig, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build the `EnvFilter` for a logging configuration.
///
/// `RUST_LOG` directives are honoured first, then the configured level and
/// extra directives are added on top.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        other => {
            return Err(ConfigError::Invalid(format!("Invalid log level: {other}")));
        }
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in &config.directives {
        let directive = directive
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("Invalid directive '{directive}': {e}")))?;
        filter = filter.add_directive(directive);
    }

    Ok(filter)
}

/// Install the global tracing subscriber.
///
/// Fails if a global subscriber has already been installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(false).with_level(true))
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };

    result.map_err(|e| ConfigError::Tracing(e.to_string()))
}
