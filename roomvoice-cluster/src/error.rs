//! Error types for the signaling transports

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Transport is not subscribed to a room")]
    NotSubscribed,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for roomvoice_core::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Serialization(e) => Self::Serialization(e),
            other => Self::Signaling(other.to_string()),
        }
    }
}
