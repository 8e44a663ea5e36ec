//! Error types for the interview voice engine

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while running a voice interview session
#[derive(Error, Debug)]
pub enum VoiceError {
    /// Microphone permission denied or recognition engine missing. Fatal to starting a session.
    #[error("Speech capture unavailable: {0}")]
    CaptureUnavailable(String),

    /// Transient recognition failure.
    #[error("Speech capture error: {0}")]
    Capture(String),

    /// The AI reply request failed.
    #[error("Completion error: {0}")]
    Completion(String),

    /// Voice request or decoding failed.
    #[error("Synthesis error: {0}")]
    Synthesis(String),

    /// Expected outcome of a barge-in or session end, not a failure.
    #[error("Cancelled")]
    Cancelled,

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VoiceError {
    /// True for the barge-in / session-end outcome that must not be surfaced as a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, VoiceError::Cancelled)
    }

    /// Errors a pipeline may retry once locally before surfacing.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VoiceError::Capture(_)
                | VoiceError::Completion(_)
                | VoiceError::Synthesis(_)
                | VoiceError::Playback(_)
                | VoiceError::Http(_)
        )
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl From<toml::de::Error> for VoiceError {
    fn from(err: toml::de::Error) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for VoiceError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        VoiceError::ChannelSend(err.to_string())
    }
}
