//! Configuration error types

/// Result type alias using [`ConfigError`]
pub type Result<T, E = ConfigError> = std::result::Result<T, E>;

/// Errors raised while loading or applying configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Reading the configuration file failed
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The file extension does not name a supported format
    #[error("Unsupported config format: {0}")]
    Format(String),

    /// The document could not be parsed
    #[error("Failed to parse {format}: {message}")]
    Parse {
        /// Format name
        format: &'static str,
        /// Parser message
        message: String,
    },

    /// A referenced environment variable is missing
    #[error("Environment variable '{0}' not set and no default provided")]
    MissingEnv(String),

    /// A value failed validation
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// The tracing subscriber could not be installed
    #[error("Failed to initialize tracing: {0}")]
    Tracing(String),
}
