use thiserror::Error;

use mindease_core::error::MindeaseError;

/// Errors raised by the speech adapters and the conversation coordinator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum VoiceError {
    /// Microphone access failed. Carries user-facing guidance.
    #[error("{0}")]
    PermissionDenied(String),

    #[error("Speech recognition error: {0}")]
    Recognition(String),

    #[error("Speech synthesis error: {0}")]
    Synthesis(String),

    #[error("Playback did not start within {0} ms")]
    PlaybackTimeout(u64),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// A precondition for voice mode is not met.
    #[error("Voice mode unavailable: {0}")]
    Unavailable(String),

    #[error("Voice coordinator is not running")]
    Closed,
}

impl From<VoiceError> for MindeaseError {
    fn from(err: VoiceError) -> Self {
        match err {
            VoiceError::PermissionDenied(guidance) => MindeaseError::PermissionDenied(guidance),
            VoiceError::Closed => MindeaseError::ShuttingDown,
            VoiceError::InvalidTransition { .. } | VoiceError::Unavailable(_) => {
                MindeaseError::InvalidState(err.to_string())
            }
            other => MindeaseError::Speech(other.to_string()),
        }
    }
}
