//! Shared resource vocabulary used across TapeGrid crates.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure to parse one of the textual enums below.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {what}: {value:?}")]
pub struct ParseEnumError {
    pub what: &'static str,
    pub value: String,
}

/// Implements `as_str`, `Display` and `FromStr` for a plain enum from a
/// single list of `Variant => "name"` pairs.
macro_rules! named_enum {
    ($ty:ident, $what:literal, { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $name),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $($name => Ok($ty::$variant),)+
                    _ => Err(ParseEnumError { what: $what, value: s.to_string() }),
                }
            }
        }
    };
}

/// Kind of storage resource. Devices only ever mount media of their own family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceFamily {
    /// Tape cartridges in a robotic library.
    Tape,
    /// Directories standing in for removable media.
    Dir,
}

named_enum!(ResourceFamily, "resource family", { Tape => "tape", Dir => "dir" });

/// Filesystem written on a medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsType {
    Ltfs,
    Posix,
}

named_enum!(FsType, "filesystem type", { Ltfs => "ltfs", Posix => "posix" });

/// Filesystem status of a medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsStatus {
    Blank,
    Formatted,
    Full,
}

named_enum!(FsStatus, "filesystem status", { Blank => "blank", Formatted => "formatted", Full => "full" });

/// Administrative status of a device or medium.
///
/// `Locked` media stay readable but never receive new writes; `Disabled`
/// resources are ignored by the scheduler entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminStatus {
    #[default]
    Unlocked,
    Locked,
    Disabled,
}

named_enum!(AdminStatus, "admin status", { Unlocked => "unlocked", Locked => "locked", Disabled => "disabled" });

/// Operational status of a drive, as tracked by the scheduler.
///
/// `Loading`, `Mounting`, `Unmounting` and `Unloading` only exist while the
/// owning device worker runs the corresponding adapter call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    #[default]
    Empty,
    Loading,
    Loaded,
    Mounting,
    Mounted,
    Unmounting,
    Unloading,
    Error,
}

named_enum!(DeviceStatus, "device status", {
    Empty => "empty",
    Loading => "loading",
    Loaded => "loaded",
    Mounting => "mounting",
    Mounted => "mounted",
    Unmounting => "unmounting",
    Unloading => "unloading",
    Error => "error",
});

impl DeviceStatus {
    /// True for the resting states a new request can start from.
    pub fn is_stable(&self) -> bool {
        matches!(self, Self::Empty | Self::Loaded | Self::Mounted)
    }
}

/// Object data layout variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutKind {
    /// Object bytes stored as-is, split sequentially across media.
    #[default]
    Simple,
    /// Object bytes zstd-compressed, then stored like `Simple`.
    Compressed,
}

named_enum!(LayoutKind, "layout", { Simple => "simple", Compressed => "compressed" });

// ── Resource identity ──────────────────────────────────────────────

/// Identity of a device or medium: its family plus a family-unique name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub family: ResourceFamily,
    pub name: String,
}

/// Medium identity (tape label or directory name).
pub type MediumId = ResourceId;

/// Device identity (drive serial or path).
pub type DeviceId = ResourceId;

impl ResourceId {
    pub fn new(family: ResourceFamily, name: impl Into<String>) -> Self {
        Self {
            family,
            name: name.into(),
        }
    }

    /// Catalog key: `{family}:{name}`.
    pub fn table_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.family, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (family, name) = s.split_once(':').ok_or_else(|| ParseEnumError {
            what: "resource id",
            value: s.to_string(),
        })?;
        Ok(Self::new(family.parse()?, name))
    }
}

/// Operations a medium accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationFlags {
    pub put: bool,
    pub get: bool,
    pub delete: bool,
}

impl Default for OperationFlags {
    fn default() -> Self {
        Self {
            put: true,
            get: true,
            delete: true,
        }
    }
}

// ── Locks ──────────────────────────────────────────────────────────

/// Something a lock can be taken on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockTarget {
    Device(DeviceId),
    Medium(MediumId),
    Object(String),
}

impl LockTarget {
    /// Catalog key: `device:{family}:{name}`, `medium:...` or `object:{oid}`.
    pub fn key(&self) -> String {
        match self {
            LockTarget::Device(id) => format!("device:{id}"),
            LockTarget::Medium(id) => format!("medium:{id}"),
            LockTarget::Object(oid) => format!("object:{oid}"),
        }
    }
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Holder of a lock: the host and a tag unique to the holding operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockOwner {
    pub hostname: String,
    pub owner: String,
}

impl LockOwner {
    pub fn new(hostname: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            owner: owner.into(),
        }
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.owner, self.hostname)
    }
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
