//! Layout and transfer state machine errors.

use tapegrid_core::ErrorKind;
use tapegrid_state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("corrupt layout for {oid}: {reason}")]
    CorruptLayout { oid: String, reason: String },

    #[error("scheduler answered {0}")]
    Scheduler(ErrorKind),

    #[error("I/O on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("catalog error: {0}")]
    State(#[from] StateError),

    #[error("no medium of the layout exists: {0}")]
    NoDevice(String),

    #[error("all media of {0} are locked by several hosts")]
    Busy(String),

    #[error("transfer cancelled")]
    Cancelled,
}

impl LayoutError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LayoutError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            LayoutError::InvalidState(_) => ErrorKind::InvalidState,
            LayoutError::CorruptLayout { .. } => ErrorKind::CorruptLayout,
            LayoutError::Scheduler(kind) => *kind,
            LayoutError::Io { .. } => ErrorKind::Io,
            LayoutError::State(e) => e.kind(),
            LayoutError::NoDevice(_) => ErrorKind::NoDevice,
            LayoutError::Busy(_) => ErrorKind::Busy,
            LayoutError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub(crate) fn corrupt(oid: &str, reason: impl Into<String>) -> Self {
        LayoutError::CorruptLayout {
            oid: oid.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: impl std::fmt::Display, source: std::io::Error) -> Self {
        LayoutError::Io {
            path: path.to_string(),
            source,
        }
    }
}

pub type LayoutResult<T> = Result<T, LayoutError>;
