//! Error types for the gateway framework.

use thiserror::Error;

/// Result type alias using [`GatewayError`].
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Failures of a device's message channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The broker session could not be set up.
    #[error("Failed to connect channel '{client_id}': {message}")]
    Connect { client_id: String, message: String },

    #[error("Failed to subscribe to {filter}: {message}")]
    Subscribe { filter: String, message: String },

    #[error("Failed to publish to {topic}: {message}")]
    Publish { topic: String, message: String },

    /// QoS outside 0..=2.
    #[error("Invalid QoS level {0} (expected 0, 1 or 2)")]
    InvalidQos(u8),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<mbgate_common::Error> for ChannelError {
    fn from(err: mbgate_common::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors that stop the gateway from starting or running.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file not found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration parse error.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration validation error.
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// PID file could not be written.
    #[error("PID file {path}: {source}")]
    PidFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Message channel error.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a configuration validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }
}

impl From<json5::Error> for GatewayError {
    fn from(err: json5::Error) -> Self {
        Self::ConfigParse(err.to_string())
    }
}

impl From<mbgate_common::Error> for GatewayError {
    fn from(err: mbgate_common::Error) -> Self {
        match err {
            mbgate_common::Error::Config(msg) => Self::Config(msg),
            mbgate_common::Error::Io(e) => Self::Io(e),
            other => Self::Config(other.to_string()),
        }
    }
}
