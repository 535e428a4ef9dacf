use thiserror::Error;

/// Every failure the recorder can report. No operation fails silently.
#[derive(Debug, Error)]
pub enum RecorderError {
    /// No capture/output device, permission denied, or the device is held
    /// by another capture.
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The capture produced no audio (zero bytes, zero frames, or the
    /// acquisition was aborted before recording started).
    #[error("Capture produced no audio")]
    EmptyCapture,

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Corrupt audio data: {0}")]
    CorruptData(String),

    /// A storable string could not be turned back into bytes.
    #[error("Invalid storable encoding: {0}")]
    InvalidEncoding(String),

    #[error("Render failed: {0}")]
    RenderFailure(String),

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RecorderError>;

impl From<hound::Error> for RecorderError {
    fn from(e: hound::Error) -> Self {
        match e {
            hound::Error::Unsupported => {
                RecorderError::UnsupportedFormat("WAV encoding not supported".to_string())
            }
            hound::Error::TooWide => {
                RecorderError::UnsupportedFormat("WAV sample width not supported".to_string())
            }
            other => RecorderError::CorruptData(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for RecorderError {
    fn from(e: tokio::task::JoinError) -> Self {
        RecorderError::RenderFailure(format!("worker task failed: {e}"))
    }
}
