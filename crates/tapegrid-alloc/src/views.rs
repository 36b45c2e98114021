//! Allocator-side snapshots of devices and media.

use serde::{Deserialize, Serialize};
use tapegrid_core::{
    AdminStatus, DeviceId, DeviceStatus, FsStatus, MediumId, OperationFlags, ResourceFamily,
};

/// A device as seen by one allocation decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceView {
    pub id: DeviceId,
    /// Stable arena index in the scheduler's registry; lower wins ties.
    pub index: usize,
    pub status: DeviceStatus,
    pub adm_status: AdminStatus,
    pub loaded: Option<MediumId>,
    /// Held by an in-flight request.
    pub locked: bool,
}

impl DeviceView {
    pub fn family(&self) -> ResourceFamily {
        self.id.family
    }

    /// Neither failed nor administratively taken out of service.
    pub fn is_usable(&self) -> bool {
        self.adm_status == AdminStatus::Unlocked && self.status != DeviceStatus::Error
    }

    /// Usable, unclaimed and resting in a stable state.
    pub fn is_idle(&self) -> bool {
        self.is_usable() && !self.locked && self.status.is_stable()
    }
}

/// A medium as seen by one allocation decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediumView {
    pub id: MediumId,
    pub adm_status: AdminStatus,
    pub fs_status: FsStatus,
    pub flags: OperationFlags,
    pub tags: Vec<String>,
    /// Free bytes.
    pub free: u64,
    pub locked: bool,
    pub last_access: u64,
    pub loaded_in: Option<DeviceId>,
}

impl MediumView {
    /// Can receive new data at all (ignoring locks).
    pub fn is_writable(&self) -> bool {
        self.flags.put
            && self.adm_status == AdminStatus::Unlocked
            && self.fs_status == FsStatus::Formatted
            && self.free > 0
    }

    /// Can be read back (ignoring locks). Admin-locked media stay readable.
    pub fn is_readable(&self) -> bool {
        self.flags.get && self.adm_status != AdminStatus::Disabled && self.fs_status != FsStatus::Blank
    }

    /// Carries every tag in `required`.
    pub fn has_tags(&self, required: &[String]) -> bool {
        required.iter().all(|tag| self.tags.contains(tag))
    }
}
