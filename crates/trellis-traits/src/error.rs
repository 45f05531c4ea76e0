//! Error types for trait operations.

use thiserror::Error;

/// Common error type for collaborator operations (transport, codecs, market data).
#[derive(Debug, Error)]
pub enum TraitError {
    /// Connection to external service failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation timed out
    #[error("timeout")]
    Timeout,

    /// Parse/deserialization error
    #[error("parse error: {0}")]
    ParseError(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Invalid input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Worker rejected or could not process a request
    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),
}

impl From<serde_json::Error> for TraitError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            TraitError::ParseError(e.to_string())
        } else {
            TraitError::SerializationError(e.to_string())
        }
    }
}
