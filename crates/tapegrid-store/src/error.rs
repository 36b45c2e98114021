//! Transfer API errors.

use tapegrid_core::ErrorKind;
use tapegrid_layout::LayoutError;
use tapegrid_lrs::LrsError;
use tapegrid_state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid transfer: {0}")]
    InvalidArgument(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object {oid} has no layout")]
    MissingLayout { oid: String },

    #[error("object {oid} is better served by {host}")]
    Remote { oid: String, host: String },

    #[error("layout error: {0}")]
    Layout(#[from] LayoutError),

    #[error("scheduler error: {0}")]
    Lrs(#[from] LrsError),

    #[error("catalog error: {0}")]
    State(#[from] StateError),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::MissingLayout { .. } => ErrorKind::CorruptLayout,
            StoreError::Remote { .. } => ErrorKind::Remote,
            StoreError::Layout(e) => e.kind(),
            StoreError::Lrs(e) => e.kind(),
            StoreError::State(e) => e.kind(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
