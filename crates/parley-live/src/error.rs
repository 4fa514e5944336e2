//! Error types for live voice sessions

use thiserror::Error;

/// Result type alias for live voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while running a live voice session
#[derive(Error, Debug)]
pub enum VoiceError {
    /// Microphone or speaker could not be acquired. Fatal, never retried.
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Capture produced frames faster than the session consumed them.
    #[error("Capture overrun: more than {capacity} frames waiting to be sent")]
    CaptureOverrun { capacity: usize },

    /// Network-level failure of the session transport.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed audio payload. The chunk is dropped, the session continues.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Payload declared a rate the output device is not running at.
    #[error("Decode error: payload rate {declared} Hz does not match output rate {expected} Hz")]
    RateMismatch { declared: u32, expected: u32 },

    #[error("Scheduling invariant violated: {0}")]
    SchedulingInvariantViolation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Credentials error: {0}")]
    Credentials(String),

    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        state: &'static str,
        operation: &'static str,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VoiceError {
    /// Whether this error ends the session. Only per-chunk decode failures are
    /// recovered locally.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, VoiceError::Decode(_) | VoiceError::RateMismatch { .. })
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<rodio::StreamError> for VoiceError {
    fn from(err: rodio::StreamError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<rodio::PlayError> for VoiceError {
    fn from(err: rodio::PlayError) -> Self {
        VoiceError::DeviceUnavailable(err.to_string())
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        VoiceError::Transport(err.to_string())
    }
}
