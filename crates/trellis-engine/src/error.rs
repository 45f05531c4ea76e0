//! Engine error types.

use thiserror::Error;

/// Engine error type.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Function repository error
    #[error("function repository error: {0}")]
    RepositoryError(String),

    /// Node not found
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// Graph contains a cycle
    #[error("circular dependency detected at {0}")]
    CircularDependency(String),

    /// Worker error
    #[error("worker error: {0}")]
    WorkerError(String),

    /// No worker available to accept a job
    #[error("no worker available")]
    NoWorkerAvailable,

    /// Timeout
    #[error("timeout")]
    Timeout,

    /// Shutdown
    #[error("engine is shutting down")]
    Shutdown,

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<trellis_traits::TraitError> for EngineError {
    fn from(e: trellis_traits::TraitError) -> Self {
        use trellis_traits::TraitError;
        match e {
            TraitError::Timeout => EngineError::Timeout,
            TraitError::WorkerUnavailable(msg) | TraitError::ConnectionFailed(msg) => {
                EngineError::WorkerError(msg)
            }
            other => EngineError::Internal(other.to_string()),
        }
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(e: toml::de::Error) -> Self {
        EngineError::ConfigError(e.to_string())
    }
}

/// Engine result type.
pub type EngineResult<T> = Result<T, EngineError>;
