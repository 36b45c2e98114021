//! Scheduler error types.

use tapegrid_alloc::AllocError;
use tapegrid_core::ErrorKind;
use tapegrid_state::StateError;
use thiserror::Error;

use crate::adapter::AdapterError;

/// Errors that can occur inside the local resource scheduler.
#[derive(Debug, Error)]
pub enum LrsError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("medium not found: {0}")]
    MediumNotFound(String),

    #[error("allocation failed: {0}")]
    Alloc(#[from] AllocError),

    #[error("device {device}: {source}")]
    Adapter {
        device: String,
        #[source]
        source: AdapterError,
    },

    #[error("catalog error: {0}")]
    State(#[from] StateError),

    #[error("submission queue full")]
    QueueFull,

    #[error("scheduler stopped")]
    Stopped,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("request failed: {0}")]
    Failed(ErrorKind),
}

impl LrsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LrsError::DeviceNotFound(_) => ErrorKind::NoDevice,
            LrsError::MediumNotFound(_) => ErrorKind::NoMedium,
            LrsError::Alloc(e) => e.kind(),
            LrsError::Adapter { .. } => ErrorKind::DeviceFault,
            LrsError::State(e) => e.kind(),
            LrsError::QueueFull => ErrorKind::QueueFull,
            LrsError::Stopped => ErrorKind::Cancelled,
            LrsError::InvalidRequest(_) => ErrorKind::InvalidArgument,
            LrsError::InvalidState(_) => ErrorKind::InvalidState,
            LrsError::Failed(kind) => *kind,
        }
    }
}

pub type LrsResult<T> = Result<T, LrsError>;
