use thiserror::Error;

/// Failures of the live session core.
///
/// Device and transport errors end the current session; decode errors only
/// cost the chunk that produced them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LiveError {
    #[error("Microphone access denied")]
    PermissionDenied,
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Failed to open live transport: {0}")]
    TransportOpenFailed(String),
    #[error("Live transport error: {0}")]
    Transport(String),
    #[error("Malformed audio chunk: {0}")]
    Decode(String),
    #[error("Config error: {0}")]
    Config(String),
}

impl LiveError {
    /// Whether this error tears the session down.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, LiveError::Decode(_))
    }
}

pub type Result<T> = std::result::Result<T, LiveError>;
