//! Error types for the core library.

use thiserror::Error;

/// Main error type for the core library.
#[derive(Error, Debug)]
pub enum Error {
    /// A remote stream was opened while offline
    #[error("not connected to the remote collection")]
    NotConnected,

    /// Remote write rejected or timed out
    #[error("dispatch failed: {0}")]
    DispatchFailed(String),

    /// Local store read/write failure
    #[error("local cache unavailable: {0}")]
    CacheUnavailable(String),

    /// Attachment capture was refused by the platform
    #[error("permission denied")]
    PermissionDenied,

    /// Attachment capture was dismissed by the user
    #[error("cancelled")]
    Cancelled,

    /// Message failed validation
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The sync engine task has shut down
    #[error("sync engine stopped")]
    EngineStopped,
}

impl Error {
    /// Whether the error should be shown to the user as a transient notice
    /// rather than treated as a programming error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::DispatchFailed(_) | Error::CacheUnavailable(_) | Error::Cancelled
        )
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        Error::CacheUnavailable(err.to_string())
    }
}
