//! Error types for the TapeGrid catalog.

use tapegrid_core::ErrorKind;
use thiserror::Error;

/// Result type alias for catalog operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during catalog operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
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

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),
}

impl StateError {
    /// Storage-level failures are reported as an unavailable catalog;
    /// lookups keep their own meaning.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StateError::NotFound(_) => ErrorKind::NotFound,
            StateError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            _ => ErrorKind::CatalogUnavailable,
        }
    }
}
