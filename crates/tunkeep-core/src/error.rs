//! Error types for `tunkeep` core library.

use thiserror::Error;

/// Result type alias using `tunkeep` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `tunkeep` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Control-channel protocol violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error came from the underlying byte stream rather than
    /// from the content of a message.
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
