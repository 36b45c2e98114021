//! Device adapter interface.
//!
//! An adapter issues drive- and robot-level commands. Calls are blocking;
//! device workers run them on the blocking thread pool. Failures carry a
//! negative errno, which the scheduler records verbatim in the hardware
//! log and maps to `DeviceFault` for the requester.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tapegrid_core::FsType;
use thiserror::Error;

pub type AdapterResult<T> = Result<T, AdapterError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (errno {code})")]
pub struct AdapterError {
    /// Negative errno.
    pub code: i32,
    pub message: String,
}

impl AdapterError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The changer rejected a move, typically a transient element state.
    pub fn is_invalid_move(&self) -> bool {
        self.code == -libc::EINVAL
    }
}

/// Raw drive state as reported by the hardware.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveState {
    /// Label of the loaded medium.
    pub loaded: Option<String>,
    pub mount_path: Option<PathBuf>,
}

/// Space on a freshly formatted medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsSpace {
    pub capacity: u64,
}

/// Hardware operations the scheduler relies on. `drive` is the device path
/// recorded in the catalog.
pub trait DeviceAdapter: Send + Sync {
    fn query_status(&self, drive: &str) -> AdapterResult<DriveState>;

    /// Move `medium` from library slot `slot` into `drive`.
    fn load(&self, drive: &str, medium: &str, slot: u64) -> AdapterResult<()>;

    /// Move the loaded medium back to its slot. Returns the slot address.
    fn unload(&self, drive: &str) -> AdapterResult<u64>;

    fn mount(&self, drive: &str, fs: FsType) -> AdapterResult<PathBuf>;

    fn umount(&self, drive: &str) -> AdapterResult<()>;

    /// Format the loaded medium, labelling it `label`.
    fn format(&self, drive: &str, fs: FsType, label: &str) -> AdapterResult<FsSpace>;

    /// Flush the mounted filesystem.
    fn sync(&self, drive: &str) -> AdapterResult<()>;
}
