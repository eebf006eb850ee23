//! Bridge error types

use std::path::PathBuf;

/// Result type alias using [`BridgeError`]
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Errors raised by value conversion, receiver dispatch and engine lifecycle
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// A host value has no foreign representation
    #[error("Cannot create value of unknown type '{type_name}': {value}")]
    InvalidType {
        /// Host type name
        type_name: &'static str,
        /// Rendering of the offending value
        value: String,
    },

    /// The foreign runtime refused to allocate a value
    #[error("Unable to create foreign value from host value '{0}'")]
    Allocation(String),

    /// A null or unknown native handle was supplied
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// No receiver is registered under this name
    #[error("Unknown receiver '{0}'")]
    UnknownReceiver(String),

    /// Two receivers were registered under the same name
    #[error("Receiver '{0}' is already registered")]
    DuplicateReceiver(String),

    /// A receiver constructor or method failed
    #[error("Receiver '{receiver}' failed: {message}")]
    Receiver {
        /// Receiver name
        receiver: String,
        /// Failure description
        message: String,
    },

    /// Binding a value into a context failed
    #[error("Binding value '{name}' to context failed: {message}")]
    Bind {
        /// Binding name
        name: String,
        /// Failure description
        message: String,
    },

    /// Script execution failed
    #[error("Error executing script '{}' in context: {message}", path.display())]
    Execution {
        /// Script path
        path: PathBuf,
        /// Failure description
        message: String,
    },

    /// Expression evaluation failed
    #[error("Error evaluating '{expression}' in context: {message}")]
    Evaluation {
        /// Expression text
        expression: String,
        /// Failure description
        message: String,
    },

    /// An engine is already active in this process
    #[error("Cannot activate multiple engine instances")]
    AlreadyActive,

    /// The embedded interpreter failed to start
    #[error("Engine failed to initialize: {0}")]
    Initialization(String),

    /// The embedded interpreter refused to create an execution scope
    #[error("Failed to initialize context: {0}")]
    ContextInitialization(String),

    /// The engine has been shut down
    #[error("Engine is not running")]
    NotRunning,

    /// Error reported by the embedded interpreter
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Create a runtime error
    pub fn runtime<S: Into<String>>(message: S) -> Self {
        Self::Runtime(message.into())
    }

    /// Create an invalid handle error
    pub fn invalid_handle<S: Into<String>>(message: S) -> Self {
        Self::InvalidHandle(message.into())
    }

    /// Create a receiver failure
    pub fn receiver<R: Into<String>, M: Into<String>>(receiver: R, message: M) -> Self {
        Self::Receiver {
            receiver: receiver.into(),
            message: message.into(),
        }
    }
}

impl From<hostbridge_config::ConfigError> for BridgeError {
    fn from(err: hostbridge_config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<Box<rhai::EvalAltResult>> for BridgeError {
    fn from(err: Box<rhai::EvalAltResult>) -> Self {
        Self::Runtime(err.to_string())
    }
}
