//! Error types for the extension runtime.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for host operations.
pub type HostResult<T> = Result<T, HostError>;

/// Errors that can occur while loading, registering or running extensions.
#[derive(Debug, Error)]
pub enum HostError {
    /// Extension entry point or manifest could not be loaded.
    #[error("Failed to load extension at {path}: {message}")]
    Load { path: PathBuf, message: String },

    /// Extension failed during its synchronous registration.
    #[error("Extension '{name}' failed to initialize: {message}")]
    Registration { name: String, message: String },

    /// Extension used a gated API member before setup completed.
    #[error("Extension '{name}' uses '{member}' before the api is enabled")]
    ApiNotReady { name: String, member: &'static str },

    /// Ready hook did not settle in time.
    #[error("Extension '{name}' did not finish initialization within {timeout_ms}ms")]
    Timeout { name: String, timeout_ms: u64 },

    /// A persistor rejected an operation.
    #[error("Persistor for '{hive}' failed: {message}")]
    Persistor { hive: String, message: String },

    /// The state store has not been attached yet.
    #[error("State store is not available yet")]
    StoreUnavailable,

    /// No API function registered under this name.
    #[error("Api function '{name}' is not registered")]
    UnknownApi { name: String },

    /// Version string or range could not be parsed.
    #[error("Invalid version '{input}': {message}")]
    InvalidVersion { input: String, message: String },

    /// Invalid host configuration.
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error raised by extension code.
    #[error("{message}")]
    Other { message: String },
}

impl HostError {
    /// Create an error from an arbitrary message.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Create a load error for an extension path.
    pub fn load(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Load {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Convert a caught panic payload into an error.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "extension panicked".to_string()
        };
        Self::Other { message }
    }

    /// Whether this error is a ready-hook timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
