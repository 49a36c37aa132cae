//! Error types for the coordination store.

use thiserror::Error;

/// Result type alias for coordination store operations.
pub type CoordResult<T> = Result<T, CoordError>;

/// Errors that can occur during coordination store operations.
#[derive(Debug, Error)]
pub enum CoordError {
    #[error("failed to open store: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}
