//! Error types for the subscriber

use thiserror::Error;

/// Subscriber error types
#[derive(Debug, Error)]
pub enum Error {
    /// The signaling channel could not be reached or dropped mid-operation
    #[error("Signaling transport error: {0}")]
    Transport(String),

    /// The server answered a request with an error field
    #[error("Request `{request}` rejected by server: {message}")]
    Protocol { request: String, message: String },

    /// The media engine cannot run in this environment
    #[error("Media engine unsupported: {0}")]
    UnsupportedEnvironment(String),

    #[error("Media engine error: {0}")]
    Media(String),

    #[error("Signaling channel not connected")]
    NotConnected,

    #[error("Timeout: {0}")]
    Timeout(String),

    /// A continuation resumed after the session it belonged to was torn down
    #[error("Session closed")]
    SessionClosed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// The session cannot proceed at all; retrying `subscribe` will not help.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::UnsupportedEnvironment(_))
    }

    /// A caller may reasonably invoke `subscribe` again after this error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Protocol { .. }
                | Self::Media(_)
                | Self::NotConnected
                | Self::Timeout(_)
                | Self::SessionClosed
        )
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Result type for subscriber operations
pub type Result<T> = std::result::Result<T, Error>;
