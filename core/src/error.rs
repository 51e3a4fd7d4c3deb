/// Error types for the realtime core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("No active session")]
    NoSession,
}

impl RealtimeError {
    /// Connectivity failures that clear up on their own once the network returns
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RealtimeError::Io(_)
                | RealtimeError::Http(_)
                | RealtimeError::Connection(_)
                | RealtimeError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RealtimeError>;
