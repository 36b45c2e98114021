//! Locating the host best placed to read an object.

use std::collections::BTreeSet;

use tapegrid_core::{DeviceId, LockTarget, MediumId};
use tapegrid_state::{LayoutInfo, StateStore};
use tracing::debug;

use crate::error::{LayoutError, LayoutResult};

/// Pick the host that can read `layout` most cheaply.
///
/// A medium already loaded in a drive and not locked wins for the host
/// managing that drive. Otherwise any unlocked medium can be fetched by
/// `focus_host`. When every medium is locked, the single host holding the
/// locks is returned; locks spread over several hosts are reported as
/// `Busy`.
pub fn locate(catalog: &StateStore, layout: &LayoutInfo, focus_host: &str) -> LayoutResult<String> {
    let mut media: Vec<&MediumId> = Vec::new();
    for extent in &layout.extents {
        if !media.contains(&&extent.medium) {
            media.push(&extent.medium);
        }
    }

    let mut existing = 0;
    let mut unlocked = false;
    let mut holders = BTreeSet::new();
    for id in media {
        let Some(medium) = catalog.get_medium(id)? else {
            continue;
        };
        existing += 1;

        if let Some(lock) = catalog.lock_holder(&LockTarget::Medium(id.clone()))? {
            holders.insert(lock.owner.hostname);
            continue;
        }
        if let Some(drive) = medium.loaded_in() {
            let device = DeviceId::new(id.family, drive);
            if let Some(info) = catalog.get_device(&device)? {
                debug!(oid = %layout.oid, medium = %id, host = %info.host, "medium already loaded");
                return Ok(info.host);
            }
        }
        unlocked = true;
    }

    if existing == 0 {
        return Err(LayoutError::NoDevice(layout.oid.clone()));
    }
    if unlocked {
        return Ok(focus_host.to_string());
    }
    match holders.len() {
        1 => Ok(holders.into_iter().next().unwrap_or_default()),
        _ => Err(LayoutError::Busy(layout.oid.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapegrid_core::{AdminStatus, ErrorKind, FsType, LayoutKind, LockOwner, ResourceFamily};
    use tapegrid_state::{DeviceInfo, Extent, ExtentState, MediumInfo, MediumLocation};

    fn tape(name: &str) -> MediumId {
        MediumId::new(ResourceFamily::Tape, name)
    }

    fn layout(media: &[&str]) -> LayoutInfo {
        LayoutInfo {
            oid: "o1".into(),
            object_uuid: "u".into(),
            version: 1,
            kind: LayoutKind::Simple,
            size: media.len() as u64,
            stored_size: media.len() as u64,
            extents: media
                .iter()
                .enumerate()
                .map(|(i, m)| Extent {
                    uuid: format!("e{i}"),
                    layout_idx: i as u32,
                    medium: tape(m),
                    address: format!("o1.{i}"),
                    offset: i as u64,
                    size: 1,
                    sha256: String::new(),
                    state: ExtentState::Sync,
                })
                .collect(),
        }
    }

    fn catalog_with(media: &[&str]) -> StateStore {
        let catalog = StateStore::open_in_memory().unwrap();
        for (slot, name) in media.iter().enumerate() {
            catalog
                .put_medium(&MediumInfo::blank(tape(name), FsType::Ltfs, 100, slot as u64))
                .unwrap();
        }
        catalog
    }

    #[test]
    fn unlocked_medium_in_slot_goes_to_focus_host() {
        let catalog = catalog_with(&["L1"]);
        assert_eq!(locate(&catalog, &layout(&["L1"]), "me").unwrap(), "me");
    }

    #[test]
    fn loaded_medium_goes_to_drive_host() {
        let catalog = catalog_with(&["L1"]);
        catalog
            .update_medium(&tape("L1"), |m| m.location = MediumLocation::Drive("st0".into()))
            .unwrap();
        catalog
            .put_device(&DeviceInfo {
                id: DeviceId::new(ResourceFamily::Tape, "st0"),
                path: "/dev/st0".into(),
                model: None,
                host: "node-2".into(),
                adm_status: AdminStatus::Unlocked,
            })
            .unwrap();
        assert_eq!(locate(&catalog, &layout(&["L1"]), "me").unwrap(), "node-2");
    }

    #[test]
    fn locked_media_resolve_to_single_holder_or_busy() {
        let catalog = catalog_with(&["L1", "L2"]);
        let lock = |m: &str, host: &str| {
            catalog
                .try_lock(&LockTarget::Medium(tape(m)), &LockOwner::new(host, "req"))
                .unwrap()
        };
        lock("L1", "node-3");
        lock("L2", "node-3");
        assert_eq!(locate(&catalog, &layout(&["L1", "L2"]), "me").unwrap(), "node-3");

        catalog
            .unlock(&LockTarget::Medium(tape("L2")), &LockOwner::new("node-3", "req"))
            .unwrap();
        lock("L2", "node-4");
        let err = locate(&catalog, &layout(&["L1", "L2"]), "me").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
    }

    #[test]
    fn no_existing_medium_is_no_device() {
        let catalog = catalog_with(&[]);
        let err = locate(&catalog, &layout(&["L1"]), "me").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoDevice);
    }
}
