//! Allocation policies.
//!
//! Writes pick the medium; reads and formats only pick the device, since
//! the medium is fixed by the layout or the caller.
//!
//! Write preference, best first:
//! 1. a medium already loaded in an idle drive with room for the whole write
//! 2. an unloaded medium with room for the whole write
//! 3. a loaded medium with some room (the write spills onto more media)
//! 4. an unloaded medium with some room
//!
//! Ties go to the least recently used medium, then to the name.

use std::cmp::Reverse;

use thiserror::Error;
use tracing::debug;

use tapegrid_core::{AdminStatus, DeviceId, ErrorKind, FsStatus, MediumId, ResourceFamily};

use crate::views::{DeviceView, MediumView};

/// A chosen (device, medium) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub device: DeviceId,
    pub medium: MediumId,
    /// The medium is already in the device; no load needed.
    pub loaded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("no usable {0} device")]
    NoDevice(ResourceFamily),

    #[error("no medium matches: {0}")]
    NoMedium(String),

    #[error("resources busy: {0}")]
    Busy(String),

    #[error("device fault: {0}")]
    DeviceFault(String),

    #[error("invalid allocation request: {0}")]
    InvalidArgument(String),
}

impl AllocError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AllocError::NoDevice(_) => ErrorKind::NoDevice,
            AllocError::NoMedium(_) => ErrorKind::NoMedium,
            AllocError::Busy(_) => ErrorKind::Busy,
            AllocError::DeviceFault(_) => ErrorKind::DeviceFault,
            AllocError::InvalidArgument(_) => ErrorKind::InvalidArgument,
        }
    }
}

/// What a write needs from a medium.
#[derive(Debug, Clone, Copy)]
pub struct WriteIntent<'a> {
    pub family: ResourceFamily,
    /// Bytes still to be written.
    pub size: u64,
    pub tags: &'a [String],
}

/// Pick a medium and a device for a write.
pub fn allocate_write(
    devices: &[DeviceView],
    media: &[MediumView],
    intent: WriteIntent<'_>,
) -> Result<Allocation, AllocError> {
    if !has_usable_device(devices, intent.family) {
        return Err(AllocError::NoDevice(intent.family));
    }

    let candidates: Vec<&MediumView> = media
        .iter()
        .filter(|m| m.id.family == intent.family && m.is_writable() && m.has_tags(intent.tags))
        .collect();
    if candidates.is_empty() {
        return Err(AllocError::NoMedium(format!(
            "writable {} medium with tags {:?}",
            intent.family, intent.tags
        )));
    }

    let mut best: Option<((u8, u64, &str), Allocation)> = None;
    for medium in candidates.iter().filter(|m| !m.locked) {
        let fits = medium.free >= intent.size;
        let option = match &medium.loaded_in {
            Some(drive) => match find_device(devices, drive) {
                Some(device) if device.is_idle() => (
                    if fits { 0 } else { 2 },
                    Allocation {
                        device: device.id.clone(),
                        medium: medium.id.clone(),
                        loaded: true,
                    },
                ),
                _ => continue,
            },
            None => match pick_device(devices, intent.family) {
                Some(device) => (
                    if fits { 1 } else { 3 },
                    Allocation {
                        device: device.id.clone(),
                        medium: medium.id.clone(),
                        loaded: false,
                    },
                ),
                None => continue,
            },
        };
        let key = (option.0, medium.last_access, medium.id.name.as_str());
        if best.as_ref().is_none_or(|(best_key, _)| key < *best_key) {
            best = Some((key, option.1));
        }
    }

    match best {
        Some(((tier, _, _), alloc)) => {
            debug!(
                device = %alloc.device,
                medium = %alloc.medium,
                tier,
                size = intent.size,
                "write allocation"
            );
            Ok(alloc)
        }
        None => Err(AllocError::Busy(format!(
            "{} candidate {} media, all locked or without an idle drive",
            candidates.len(),
            intent.family
        ))),
    }
}

/// Pick a device to read `medium`, preferring the drive it is loaded in.
pub fn allocate_read(devices: &[DeviceView], medium: &MediumView) -> Result<Allocation, AllocError> {
    if !medium.is_readable() {
        return Err(AllocError::NoMedium(format!("{} is not readable", medium.id)));
    }
    place_medium(devices, medium)
}

/// Pick a device to format `medium`, which must be blank.
pub fn allocate_format(
    devices: &[DeviceView],
    medium: &MediumView,
) -> Result<Allocation, AllocError> {
    if medium.fs_status != FsStatus::Blank {
        return Err(AllocError::InvalidArgument(format!(
            "{} is {}, not blank",
            medium.id, medium.fs_status
        )));
    }
    if medium.adm_status == AdminStatus::Disabled {
        return Err(AllocError::NoMedium(format!("{} is disabled", medium.id)));
    }
    place_medium(devices, medium)
}

/// Device selection for a fixed medium.
fn place_medium(devices: &[DeviceView], medium: &MediumView) -> Result<Allocation, AllocError> {
    let family = medium.id.family;
    if !has_usable_device(devices, family) {
        return Err(AllocError::NoDevice(family));
    }
    if medium.locked {
        return Err(AllocError::Busy(format!("{} is locked", medium.id)));
    }

    let device = match &medium.loaded_in {
        Some(drive) => match find_device(devices, drive) {
            Some(device) if device.is_idle() => Some((device, true)),
            // Stuck until the drive is reset; waiting would not help.
            Some(device) if !device.is_usable() => {
                return Err(AllocError::DeviceFault(format!(
                    "{} is held by unusable device {} ({})",
                    medium.id, device.id, device.status
                )));
            }
            Some(device) => {
                return Err(AllocError::Busy(format!(
                    "{} is loaded in busy device {}",
                    medium.id, device.id
                )));
            }
            None => {
                return Err(AllocError::Busy(format!(
                    "{} is loaded in unmanaged drive {drive}",
                    medium.id
                )));
            }
        },
        None => pick_device(devices, family).map(|device| (device, false)),
    };

    match device {
        Some((device, loaded)) => Ok(Allocation {
            device: device.id.clone(),
            medium: medium.id.clone(),
            loaded,
        }),
        None => Err(AllocError::Busy(format!("no idle {family} device"))),
    }
}

fn has_usable_device(devices: &[DeviceView], family: ResourceFamily) -> bool {
    devices.iter().any(|d| d.family() == family && d.is_usable())
}

fn find_device<'a>(devices: &'a [DeviceView], id: &DeviceId) -> Option<&'a DeviceView> {
    devices.iter().find(|d| &d.id == id)
}

/// An idle device of `family` to load a medium into: empty drives first,
/// then the lowest arena index.
fn pick_device(devices: &[DeviceView], family: ResourceFamily) -> Option<&DeviceView> {
    devices
        .iter()
        .filter(|d| d.family() == family && d.is_idle())
        .min_by_key(|d| (Reverse(d.loaded.is_none()), d.index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapegrid_core::{DeviceStatus, OperationFlags};

    fn drive(name: &str, index: usize) -> DeviceView {
        DeviceView {
            id: DeviceId::new(ResourceFamily::Tape, name),
            index,
            status: DeviceStatus::Empty,
            adm_status: AdminStatus::Unlocked,
            loaded: None,
            locked: false,
        }
    }

    fn tape(name: &str, free: u64, last_access: u64) -> MediumView {
        MediumView {
            id: MediumId::new(ResourceFamily::Tape, name),
            adm_status: AdminStatus::Unlocked,
            fs_status: FsStatus::Formatted,
            flags: OperationFlags::default(),
            tags: Vec::new(),
            free,
            locked: false,
            last_access,
            loaded_in: None,
        }
    }

    fn load(device: &mut DeviceView, medium: &mut MediumView) {
        device.status = DeviceStatus::Mounted;
        device.loaded = Some(medium.id.clone());
        medium.loaded_in = Some(device.id.clone());
    }

    fn write(size: u64, tags: &[String]) -> WriteIntent<'_> {
        WriteIntent {
            family: ResourceFamily::Tape,
            size,
            tags,
        }
    }

    // ── Writes ─────────────────────────────────────────────────────

    #[test]
    fn write_prefers_mounted_medium_with_room() {
        let mut devices = vec![drive("st0", 0), drive("st1", 1)];
        let mut media = vec![tape("L1", 1000, 1), tape("L2", 1000, 50)];
        load(&mut devices[1], &mut media[1]);

        let alloc = allocate_write(&devices, &media, write(500, &[])).unwrap();
        assert_eq!(alloc.medium.name, "L2");
        assert_eq!(alloc.device.name, "st1");
        assert!(alloc.loaded);
    }

    #[test]
    fn write_prefers_unmounted_fit_over_mounted_partial() {
        let mut devices = vec![drive("st0", 0), drive("st1", 1)];
        let mut media = vec![tape("L1", 1000, 9), tape("L2", 100, 1)];
        load(&mut devices[1], &mut media[1]);

        let alloc = allocate_write(&devices, &media, write(500, &[])).unwrap();
        assert_eq!(alloc.medium.name, "L1");
        assert_eq!(alloc.device.name, "st0");
        assert!(!alloc.loaded);
    }

    #[test]
    fn write_breaks_ties_by_least_recently_used() {
        let devices = vec![drive("st0", 0)];
        let media = vec![tape("L1", 1000, 300), tape("L2", 1000, 100), tape("L3", 1000, 200)];

        let alloc = allocate_write(&devices, &media, write(10, &[])).unwrap();
        assert_eq!(alloc.medium.name, "L2");
    }

    #[test]
    fn write_accepts_partial_room_when_nothing_fits() {
        let devices = vec![drive("st0", 0)];
        let media = vec![tape("L1", 600, 0)];

        let alloc = allocate_write(&devices, &media, write(1000, &[])).unwrap();
        assert_eq!(alloc.medium.name, "L1");
    }

    #[test]
    fn write_honours_tags_flags_and_admin_status() {
        let devices = vec![drive("st0", 0)];
        let mut tagged = tape("L1", 1000, 0);
        tagged.tags = vec!["fast".into()];
        let mut no_put = tape("L2", 1000, 0);
        no_put.tags = vec!["fast".into()];
        no_put.flags.put = false;
        let mut admin_locked = tape("L3", 1000, 0);
        admin_locked.tags = vec!["fast".into()];
        admin_locked.adm_status = AdminStatus::Locked;
        let mut full = tape("L4", 0, 0);
        full.tags = vec!["fast".into()];
        let plain = tape("L5", 1000, 0);
        let media = vec![plain, no_put, admin_locked, full, tagged];

        let tags = vec!["fast".to_string()];
        let alloc = allocate_write(&devices, &media, write(10, &tags)).unwrap();
        assert_eq!(alloc.medium.name, "L1");
    }

    #[test]
    fn write_without_candidate_media_is_no_medium() {
        let devices = vec![drive("st0", 0)];
        let mut blank = tape("L1", 1000, 0);
        blank.fs_status = FsStatus::Blank;

        let err = allocate_write(&devices, &[blank], write(10, &[])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoMedium);
    }

    #[test]
    fn write_without_devices_is_no_device() {
        let mut failed = drive("st0", 0);
        failed.status = DeviceStatus::Error;
        let media = vec![tape("L1", 1000, 0)];

        let err = allocate_write(&[failed], &media, write(10, &[])).unwrap_err();
        assert_eq!(err, AllocError::NoDevice(ResourceFamily::Tape));
    }

    #[test]
    fn write_with_everything_locked_is_busy() {
        let mut device = drive("st0", 0);
        device.locked = true;
        let mut locked_medium = tape("L1", 1000, 0);
        locked_medium.locked = true;
        let free_medium = tape("L2", 1000, 0);

        let err = allocate_write(&[device], &[locked_medium, free_medium], write(10, &[]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert!(err.kind().is_retryable());
    }

    #[test]
    fn write_skips_medium_loaded_in_busy_drive() {
        let mut devices = vec![drive("st0", 0), drive("st1", 1)];
        let mut media = vec![tape("L1", 1000, 0), tape("L2", 1000, 5)];
        load(&mut devices[0], &mut media[0]);
        devices[0].locked = true;

        let alloc = allocate_write(&devices, &media, write(10, &[])).unwrap();
        assert_eq!(alloc.medium.name, "L2");
        assert_eq!(alloc.device.name, "st1");
    }

    #[test]
    fn empty_drive_preferred_for_loads() {
        let mut devices = vec![drive("st0", 0), drive("st1", 1)];
        let mut other = tape("L9", 0, 0);
        load(&mut devices[0], &mut other);
        let media = vec![other, tape("L1", 1000, 0)];

        let alloc = allocate_write(&devices, &media, write(10, &[])).unwrap();
        assert_eq!(alloc.device.name, "st1");
    }

    // ── Reads and formats ──────────────────────────────────────────

    #[test]
    fn read_prefers_drive_holding_the_medium() {
        let mut devices = vec![drive("st0", 0), drive("st1", 1)];
        let mut medium = tape("L1", 0, 0);
        load(&mut devices[1], &mut medium);

        let alloc = allocate_read(&devices, &medium).unwrap();
        assert_eq!(alloc.device.name, "st1");
        assert!(alloc.loaded);
    }

    #[test]
    fn read_of_admin_locked_medium_is_allowed() {
        let devices = vec![drive("st0", 0)];
        let mut medium = tape("L1", 0, 0);
        medium.adm_status = AdminStatus::Locked;
        medium.fs_status = FsStatus::Full;

        assert!(allocate_read(&devices, &medium).is_ok());
    }

    #[test]
    fn read_of_locked_medium_is_busy() {
        let devices = vec![drive("st0", 0)];
        let mut medium = tape("L1", 0, 0);
        medium.locked = true;

        assert_eq!(allocate_read(&devices, &medium).unwrap_err().kind(), ErrorKind::Busy);
    }

    #[test]
    fn read_of_medium_in_faulted_drive_is_device_fault() {
        let mut devices = vec![drive("st0", 0), drive("st1", 1)];
        let mut medium = tape("L1", 0, 0);
        load(&mut devices[0], &mut medium);
        devices[0].status = DeviceStatus::Error;

        let err = allocate_read(&devices, &medium).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceFault);
        assert!(!err.kind().is_retryable());

        devices[0].status = DeviceStatus::Mounted;
        devices[0].adm_status = AdminStatus::Disabled;
        assert_eq!(
            allocate_read(&devices, &medium).unwrap_err().kind(),
            ErrorKind::DeviceFault
        );
    }

    #[test]
    fn read_with_all_drives_busy_is_busy() {
        let mut device = drive("st0", 0);
        device.locked = true;
        let medium = tape("L1", 0, 0);

        assert_eq!(allocate_read(&[device], &medium).unwrap_err().kind(), ErrorKind::Busy);
    }

    #[test]
    fn format_requires_blank_medium() {
        let devices = vec![drive("st0", 0)];
        let formatted = tape("L1", 10, 0);
        assert_eq!(
            allocate_format(&devices, &formatted).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );

        let mut blank = tape("L2", 10, 0);
        blank.fs_status = FsStatus::Blank;
        let alloc = allocate_format(&devices, &blank).unwrap();
        assert_eq!(alloc.device.name, "st0");
    }

    #[test]
    fn format_of_other_family_is_no_device() {
        let devices = vec![drive("st0", 0)];
        let mut blank = tape("d1", 10, 0);
        blank.id = MediumId::new(ResourceFamily::Dir, "d1");
        blank.fs_status = FsStatus::Blank;

        assert_eq!(
            allocate_format(&devices, &blank).unwrap_err(),
            AllocError::NoDevice(ResourceFamily::Dir)
        );
    }
}
