//! Configuration validation

use crate::{BridgeConfig, ConfigError, Result};

const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Validate configuration
pub fn validate_config(config: &BridgeConfig) -> Result<()> {
    validate_runtime(config)?;
    validate_logging(config)?;

    Ok(())
}

fn validate_runtime(config: &BridgeConfig) -> Result<()> {
    let runtime = &config.runtime;

    if runtime.max_handles == 0 {
        return Err(ConfigError::Invalid("max_handles must be > 0".to_string()));
    }

    if runtime.max_expr_depth == 0 {
        return Err(ConfigError::Invalid("max_expr_depth must be > 0".to_string()));
    }

    if runtime.max_operations == 0 {
        tracing::debug!("max_operations is unlimited; scripts run to completion");
    }

    if !runtime.log_errors && !runtime.display_errors {
        tracing::warn!("script errors are neither logged nor displayed");
    }

    Ok(())
}

fn validate_logging(config: &BridgeConfig) -> Result<()> {
    let level = config.logging.level.to_lowercase();
    if !LEVELS.contains(&level.as_str()) {
        return Err(ConfigError::Invalid(format!(
            "Invalid log level: {} (must be one of {})",
            config.logging.level,
            LEVELS.join(", ")
        )));
    }

    Ok(())
}
