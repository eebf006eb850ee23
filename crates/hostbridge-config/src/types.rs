//! Configuration types

use serde::{Deserialize, Serialize};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    /// Embedded interpreter settings
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Embedded interpreter configuration
///
/// Limits of `0` mean unlimited, except `max_expr_depth`, which must be set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    /// Maximum number of live value handles; allocations beyond this fail
    #[serde(default = "default_max_handles")]
    pub max_handles: usize,

    /// Maximum number of operations a single script may perform
    #[serde(default)]
    pub max_operations: u64,

    /// Maximum length of a string produced by a script
    #[serde(default)]
    pub max_string_size: usize,

    /// Maximum number of elements in an array produced by a script
    #[serde(default)]
    pub max_array_size: usize,

    /// Maximum number of entries in a map produced by a script
    #[serde(default)]
    pub max_map_size: usize,

    /// Maximum nesting depth of expressions (global, function bodies)
    #[serde(default = "default_max_expr_depth")]
    pub max_expr_depth: usize,

    /// Write script errors to the context's log sink
    #[serde(default = "default_true")]
    pub log_errors: bool,

    /// Write script errors to the context's output sink
    #[serde(default)]
    pub display_errors: bool,
}

fn default_max_handles() -> usize {
    65_536
}

fn default_max_expr_depth() -> usize {
    64
}

fn default_true() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_handles: default_max_handles(),
            max_operations: 0,
            max_string_size: 0,
            max_array_size: 0,
            max_map_size: 0,
            max_expr_depth: default_max_expr_depth(),
            log_errors: true,
            display_errors: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,

    /// Additional `EnvFilter` directives, e.g. `rhai=warn`
    #[serde(default)]
    pub directives: Vec<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            directives: Vec::new(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable
    #[default]
    Text,
    /// One JSON object per event
    Json,
}
