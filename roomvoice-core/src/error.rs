use thiserror::Error;

/// Microphone acquisition failures. Fatal to `connect`, never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("No audio input device available")]
    NoDevice,

    #[error("Audio capture requires a secure context")]
    InsecureContext,

    #[error("Audio device error: {0}")]
    Device(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("ICE error: {0}")]
    Ice(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Session is already connected")]
    AlreadyConnected,

    #[error("Session is not connected")]
    NotConnected,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error should be surfaced through the session's `error` field.
    ///
    /// Negotiation races and ICE trouble are recovered locally and only logged.
    #[must_use]
    pub const fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::Capture(_) | Self::Signaling(_) | Self::AlreadyConnected | Self::NotConnected
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
