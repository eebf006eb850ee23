//! # Hostbridge Configuration
//!
//! Configuration for the embedded interpreter bridge:
//! - Multiple formats (YAML, TOML, JSON)
//! - Environment variable expansion
//! - Validation
//! - Defaults matching the embedded engine's startup settings
//! - Tracing subscriber setup

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod error;
pub mod loader;
pub mod logging;
pub mod types;
pub mod validator;

pub use error::{ConfigError, Result};
pub use loader::{load_config, load_from_file, load_from_str};
pub use logging::init_tracing;
pub use types::{BridgeConfig, LogFormat, LoggingConfig, RuntimeConfig};
pub use validator::validate_config;

use std::path::Path;

/// Configuration format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML format
    Yaml,
    /// TOML format
    Toml,
    /// JSON format
    Json,
}

impl ConfigFormat {
    /// Detect format from file extension
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ConfigError::Format(format!("{}", path.display())))?;

        match ext {
            "yaml" | "yml" => Ok(ConfigFormat::Yaml),
            "toml" => Ok(ConfigFormat::Toml),
            "json" => Ok(ConfigFormat::Json),
            _ => Err(ConfigError::Format(ext.to_string())),
        }
    }
}
