//! Type conversions from catalog records to allocator views.

use std::collections::HashSet;

use tapegrid_core::{DeviceId, LockTarget};
use tapegrid_state::{LockRecord, MediumInfo};

use crate::views::MediumView;

/// Convert a [`MediumInfo`] to a [`MediumView`].
///
/// `locked` is passed externally because lock state lives in its own table.
pub fn medium_view(medium: &MediumInfo, locked: bool) -> MediumView {
    MediumView {
        id: medium.id.clone(),
        adm_status: medium.adm_status,
        fs_status: medium.fs.status,
        flags: medium.flags,
        tags: medium.tags.clone(),
        free: medium.free(),
        locked,
        last_access: medium.last_access,
        loaded_in: medium
            .loaded_in()
            .map(|drive| DeviceId::new(medium.id.family, drive)),
    }
}

/// Keys of every lock currently held, for cheap membership checks.
pub fn locked_keys(locks: &[LockRecord]) -> HashSet<String> {
    locks.iter().map(|lock| lock.key.clone()).collect()
}

/// Views for every medium, with lock state taken from `locks`.
pub fn medium_views(media: &[MediumInfo], locks: &HashSet<String>) -> Vec<MediumView> {
    media
        .iter()
        .map(|m| medium_view(m, locks.contains(&LockTarget::Medium(m.id.clone()).key())))
        .collect()
}
