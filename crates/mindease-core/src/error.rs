use thiserror::Error;

/// Top-level error type for the MindEase client.
///
/// Subsystem crates define their own error types and implement
/// `From<SubsystemError> for MindeaseError` so that the `?` operator works
/// across crate boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MindeaseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Credentials expired: {0}")]
    CredentialsExpired(String),

    #[error("Session is not authenticated")]
    Unauthenticated,

    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Speech service error: {0}")]
    Speech(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl MindeaseError {
    /// Whether the error is a transient network condition that the
    /// reconnection or offline-queue paths recover from.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MindeaseError::Network(_) | MindeaseError::Transport(_) | MindeaseError::Timeout(_)
        )
    }

    /// Whether an error message reported by the server signals an expired
    /// bearer credential.
    pub fn is_expiry_message(message: &str) -> bool {
        message.to_ascii_lowercase().contains("expired")
    }
}

impl From<toml::de::Error> for MindeaseError {
    fn from(err: toml::de::Error) -> Self {
        MindeaseError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for MindeaseError {
    fn from(err: toml::ser::Error) -> Self {
        MindeaseError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for MindeaseError {
    fn from(err: serde_json::Error) -> Self {
        MindeaseError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for MindEase operations.
pub type Result<T> = std::result::Result<T, MindeaseError>;
