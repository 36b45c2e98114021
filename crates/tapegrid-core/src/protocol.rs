//! Request/response contract between transfer state machines and the
//! local resource scheduler.
//!
//! A client submits a [`Request`] and receives a [`CorrelationId`]; the
//! scheduler later answers with exactly one [`Response`] carrying that id.
//! A `Ready` response grants exclusive use of a mounted medium until the
//! client submits the matching `Release`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::types::{DeviceId, FsType, MediumId, ResourceFamily};

/// Identifier assigned by the scheduler to each submitted request.
pub type CorrelationId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    /// Mount a writable medium of `family` carrying every tag in `tags`.
    /// `size` is the amount still to be written; a medium with less free
    /// space may be granted.
    Write {
        family: ResourceFamily,
        size: u64,
        tags: Vec<String>,
    },
    /// Mount the given medium for reading.
    Read { medium: MediumId },
    /// Format a blank medium, optionally unlocking it for writes afterwards.
    Format {
        medium: MediumId,
        fs: FsType,
        unlock: bool,
    },
    /// Give back the medium granted by the `Ready` response to `grant`.
    Release {
        grant: CorrelationId,
        size_written: u64,
        /// Client-side I/O failure, if any, for the audit trail.
        status: Option<ErrorKind>,
    },
}

impl Request {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Request::Write { .. } => "write",
            Request::Read { .. } => "read",
            Request::Format { .. } => "format",
            Request::Release { .. } => "release",
        }
    }
}

/// Where a granted medium can be accessed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    pub device: DeviceId,
    pub medium: MediumId,
    pub mount_path: PathBuf,
    pub fs_type: FsType,
    /// Free bytes on the medium at grant time.
    pub avail: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Ready(MountInfo),
    Formatted { medium: MediumId },
    Released { medium: MediumId },
    Error { kind: ErrorKind },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: CorrelationId,
    pub outcome: Outcome,
}

impl Response {
    pub fn error(id: CorrelationId, kind: ErrorKind) -> Self {
        Self {
            id,
            outcome: Outcome::Error { kind },
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self.outcome {
            Outcome::Error { kind } => Some(kind),
            _ => None,
        }
    }
}
