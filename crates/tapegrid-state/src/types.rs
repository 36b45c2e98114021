//! Domain records persisted in the catalog.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tapegrid_core::{
    AdminStatus, DeviceId, FsStatus, FsType, LayoutKind, LockOwner, MediumId, OperationFlags,
};

// ── Devices ────────────────────────────────────────────────────────

/// A drive known to the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    /// Path the adapter uses to address the drive (e.g. `/dev/st0`).
    pub path: String,
    pub model: Option<String>,
    /// Host whose scheduler manages this drive.
    pub host: String,
    pub adm_status: AdminStatus,
}

impl DeviceInfo {
    pub fn table_key(&self) -> String {
        self.id.table_key()
    }
}

// ── Media ──────────────────────────────────────────────────────────

/// Filesystem state of a medium.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediumFs {
    pub fs_type: FsType,
    pub status: FsStatus,
    pub label: Option<String>,
}

/// Where a medium physically is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "at", rename_all = "snake_case")]
pub enum MediumLocation {
    /// Library storage slot address.
    Slot(u64),
    /// Loaded in the named drive.
    Drive(String),
}

/// A removable medium known to the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediumInfo {
    pub id: MediumId,
    pub model: Option<String>,
    pub adm_status: AdminStatus,
    pub fs: MediumFs,
    pub flags: OperationFlags,
    pub tags: Vec<String>,
    /// Total usable bytes.
    pub capacity: u64,
    pub used: u64,
    /// Number of extents written to the medium.
    pub nb_obj: u64,
    /// Unix timestamp (seconds) of the last grant.
    pub last_access: u64,
    pub location: MediumLocation,
}

impl MediumInfo {
    /// A blank medium sitting in `slot`, with default flags and no tags.
    pub fn blank(id: MediumId, fs_type: FsType, capacity: u64, slot: u64) -> Self {
        Self {
            id,
            model: None,
            adm_status: AdminStatus::Unlocked,
            fs: MediumFs {
                fs_type,
                status: FsStatus::Blank,
                label: None,
            },
            flags: OperationFlags::default(),
            tags: Vec::new(),
            capacity,
            used: 0,
            nb_obj: 0,
            last_access: 0,
            location: MediumLocation::Slot(slot),
        }
    }

    pub fn table_key(&self) -> String {
        self.id.table_key()
    }

    pub fn free(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }

    /// Account for `written` bytes, switching to `Full` once exhausted.
    pub fn record_write(&mut self, written: u64) {
        self.used = self.used.saturating_add(written);
        if written > 0 {
            self.nb_obj += 1;
        }
        if self.fs.status == FsStatus::Formatted && self.free() == 0 {
            self.fs.status = FsStatus::Full;
        }
    }

    /// Name of the drive the medium is loaded in, if any.
    pub fn loaded_in(&self) -> Option<&str> {
        match &self.location {
            MediumLocation::Drive(name) => Some(name),
            MediumLocation::Slot(_) => None,
        }
    }
}

// ── Objects ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ObjectStatus {
    /// Reserved by an in-flight put; not readable yet.
    Incomplete,
    Complete,
}

/// Object metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectInfo {
    pub oid: String,
    pub uuid: String,
    pub version: u32,
    pub user_md: BTreeMap<String, String>,
    pub status: ObjectStatus,
    /// Logical object size in bytes.
    pub size: u64,
    pub created_at: u64,
    pub access_time: u64,
}

// ── Layouts ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExtentState {
    /// Written but the medium has not been synced yet.
    Pending,
    Sync,
    /// No longer referenced by any object; space not reclaimed.
    Orphan,
}

/// One contiguous range of an object's stored bytes on one medium.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Extent {
    pub uuid: String,
    /// Position in the layout, in creation order.
    pub layout_idx: u32,
    pub medium: MediumId,
    /// File name relative to the medium's mount point.
    pub address: String,
    /// Offset of this range within the stored stream.
    pub offset: u64,
    pub size: u64,
    /// Hex SHA-256 of the extent bytes.
    pub sha256: String,
    pub state: ExtentState,
}

/// How an object's bytes map onto extents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LayoutInfo {
    pub oid: String,
    pub object_uuid: String,
    pub version: u32,
    pub kind: LayoutKind,
    /// Logical object size.
    pub size: u64,
    /// Sum of extent sizes (differs from `size` for compressed layouts).
    pub stored_size: u64,
    pub extents: Vec<Extent>,
}

// ── Locks ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockRecord {
    pub key: String,
    pub owner: LockOwner,
    pub timestamp: u64,
}

// ── Hardware logs ──────────────────────────────────────────────────

/// Physical action a log entry describes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogCause {
    DeviceLoad,
    DeviceUnload,
    Mount,
    Umount,
    Format,
    Sync,
    Query,
}

/// One physical action attempted on a device, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    /// Assigned by the catalog on append.
    pub seq: u64,
    pub device: DeviceId,
    pub medium: Option<MediumId>,
    pub cause: LogCause,
    /// 0 on success, negative errno otherwise.
    pub errno: i32,
    pub message: serde_json::Value,
    pub time: u64,
}
