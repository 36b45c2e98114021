//! Error taxonomy shared by the scheduler, the layout engine and the
//! transfer API.
//!
//! Every crate-specific error maps onto one [`ErrorKind`]; the kind is what
//! travels in scheduler responses and what callers see as a transfer's
//! status code.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed request or caller bug.
    InvalidArgument,
    /// Candidate resources exist but are all locked right now.
    Busy,
    /// A busy resource did not free up within the configured timeout.
    Timeout,
    /// No device of the requested family can serve the request.
    NoDevice,
    /// No medium satisfies the request's constraints.
    NoMedium,
    /// The device adapter reported a hardware error.
    DeviceFault,
    /// The catalog could not be reached within the retry budget.
    CatalogUnavailable,
    /// A layout's extents are inconsistent with its object.
    CorruptLayout,
    /// Protocol misuse, such as stepping a finished encoder.
    InvalidState,
    /// The scheduler's submission queue is full.
    QueueFull,
    NotFound,
    AlreadyExists,
    Cancelled,
    /// Another host is better placed to serve the request.
    Remote,
    /// Local I/O against a mounted medium failed.
    Io,
}

impl ErrorKind {
    /// Whether a caller may retry the same request after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Busy | Self::Timeout | Self::CatalogUnavailable | Self::QueueFull
        )
    }

    /// Negative errno equivalent, used as a transfer status code.
    pub fn errno(&self) -> i32 {
        -match self {
            Self::InvalidArgument => libc::EINVAL,
            Self::Busy => libc::EBUSY,
            Self::Timeout => libc::ETIMEDOUT,
            Self::NoDevice => libc::ENODEV,
            Self::NoMedium => libc::ENOSPC,
            Self::DeviceFault => libc::EIO,
            Self::CatalogUnavailable => libc::ECOMM,
            Self::CorruptLayout => libc::EBADMSG,
            Self::InvalidState => libc::EPROTO,
            Self::QueueFull => libc::EAGAIN,
            Self::NotFound => libc::ENOENT,
            Self::AlreadyExists => libc::EEXIST,
            Self::Cancelled => libc::ECANCELED,
            Self::Remote => libc::EREMOTE,
            Self::Io => libc::EIO,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid argument",
            Self::Busy => "resource busy",
            Self::Timeout => "timed out",
            Self::NoDevice => "no device",
            Self::NoMedium => "no medium",
            Self::DeviceFault => "device fault",
            Self::CatalogUnavailable => "catalog unavailable",
            Self::CorruptLayout => "corrupt layout",
            Self::InvalidState => "invalid state",
            Self::QueueFull => "queue full",
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::Cancelled => "cancelled",
            Self::Remote => "remote host",
            Self::Io => "i/o error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for ErrorKind {}
