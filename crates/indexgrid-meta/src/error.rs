//! Error types for the metadata repository.

use thiserror::Error;

/// Result type alias for repository operations.
pub type MetaResult<T> = Result<T, MetaError>;

/// Errors that can occur during metadata repository operations.
#[derive(Debug, Error)]
pub enum MetaError {
    #[error("failed to open repository: {0}")]
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

    #[error("index definition {0} already exists")]
    DuplicateDefinition(u64),

    #[error("missing local record: {0}")]
    MissingLocal(&'static str),
}
