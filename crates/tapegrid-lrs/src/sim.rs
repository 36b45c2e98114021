//! Directory-backed simulated tape library.
//!
//! Drives, slots and media live in a JSON state file under the library
//! root, so the simulated hardware survives across processes. Each medium's
//! data is a directory `media/<label>` under the root, which is also its
//! mount point. Faults can be injected per drive and action, and actions
//! can be slowed down to mimic robot and drive latency.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tapegrid_core::FsType;
use tracing::debug;

use crate::adapter::{AdapterError, AdapterResult, DeviceAdapter, DriveState, FsSpace};

const STATE_FILE: &str = "library.json";

/// Adapter action a fault can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimAction {
    Query,
    Load,
    Unload,
    Mount,
    Umount,
    Format,
    Sync,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SimDrive {
    /// Loaded medium and the slot it came from.
    loaded: Option<(String, u64)>,
    mounted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimMedium {
    capacity: u64,
    formatted: Option<FsType>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LibraryState {
    drives: BTreeMap<String, SimDrive>,
    /// Slot address to medium label.
    slots: BTreeMap<u64, String>,
    media: BTreeMap<String, SimMedium>,
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    code: i32,
    remaining: u32,
}

pub struct SimLibrary {
    root: PathBuf,
    state: Mutex<LibraryState>,
    faults: Mutex<HashMap<(String, SimAction), Fault>>,
    latency: Mutex<HashMap<SimAction, Duration>>,
}

impl SimLibrary {
    /// Open the library rooted at `root`, creating it if needed.
    pub fn open(root: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(root.join("media"))?;
        let state_path = root.join(STATE_FILE);
        let state = if state_path.exists() {
            let content = std::fs::read(&state_path)?;
            serde_json::from_slice(&content).map_err(io::Error::other)?
        } else {
            LibraryState::default()
        };
        debug!(root = %root.display(), "simulated library opened");
        Ok(Self {
            root: root.to_path_buf(),
            state: Mutex::new(state),
            faults: Mutex::new(HashMap::new()),
            latency: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding `medium`'s data.
    pub fn medium_path(&self, medium: &str) -> PathBuf {
        self.root.join("media").join(medium)
    }

    pub fn add_drive(&self, drive: &str) -> io::Result<()> {
        let mut state = self.lock_state();
        if state.drives.contains_key(drive) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("drive {drive} already exists"),
            ));
        }
        state.drives.insert(drive.to_string(), SimDrive::default());
        self.persist(&state)
    }

    /// Put a blank medium of `capacity` bytes into slot `slot`.
    pub fn add_medium(&self, medium: &str, slot: u64, capacity: u64) -> io::Result<()> {
        let mut state = self.lock_state();
        if state.media.contains_key(medium) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("medium {medium} already exists"),
            ));
        }
        if let Some(other) = state.slots.get(&slot) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("slot {slot} already holds {other}"),
            ));
        }
        state.slots.insert(slot, medium.to_string());
        state.media.insert(
            medium.to_string(),
            SimMedium {
                capacity,
                formatted: None,
            },
        );
        self.persist(&state)
    }

    /// Smallest free slot address.
    pub fn free_slot(&self) -> u64 {
        let state = self.lock_state();
        (0..).find(|addr| !state.slots.contains_key(addr)).unwrap_or_default()
    }

    /// Make the next `times` calls of `action` on `drive` fail with `code`
    /// (a negative errno).
    pub fn inject_fault(&self, drive: &str, action: SimAction, code: i32, times: u32) {
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        faults.insert(
            (drive.to_string(), action),
            Fault {
                code,
                remaining: times,
            },
        );
    }

    /// Make every later `action` on any drive take at least `delay`.
    pub fn set_latency(&self, action: SimAction, delay: Duration) {
        let mut latency = self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        latency.insert(action, delay);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LibraryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, state: &LibraryState) -> io::Result<()> {
        let content = serde_json::to_vec_pretty(state).map_err(io::Error::other)?;
        std::fs::write(self.root.join(STATE_FILE), content)
    }

    fn save(&self, state: &LibraryState) -> AdapterResult<()> {
        self.persist(state)
            .map_err(|e| AdapterError::new(-libc::EIO, format!("saving library state: {e}")))
    }

    /// Apply the configured latency, then consume one injected fault for
    /// (`drive`, `action`), if armed.
    fn check_fault(&self, drive: &str, action: SimAction) -> AdapterResult<()> {
        let delay = self
            .latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&action)
            .copied();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (drive.to_string(), action);
        if let Some(fault) = faults.get_mut(&key) {
            if fault.remaining > 0 {
                fault.remaining -= 1;
                let code = fault.code;
                if fault.remaining == 0 {
                    faults.remove(&key);
                }
                return Err(AdapterError::new(
                    code,
                    format!("injected {action:?} fault on {drive}"),
                ));
            }
        }
        Ok(())
    }
}

fn no_drive(drive: &str) -> AdapterError {
    AdapterError::new(-libc::ENXIO, format!("no such drive {drive}"))
}

fn empty_drive(drive: &str) -> AdapterError {
    AdapterError::new(-libc::ENOMEDIUM, format!("drive {drive} is empty"))
}

impl DeviceAdapter for SimLibrary {
    fn query_status(&self, drive: &str) -> AdapterResult<DriveState> {
        self.check_fault(drive, SimAction::Query)?;
        let state = self.lock_state();
        let sim = state.drives.get(drive).ok_or_else(|| no_drive(drive))?;
        let loaded = sim.loaded.as_ref().map(|(label, _)| label.clone());
        let mount_path = match (&loaded, sim.mounted) {
            (Some(label), true) => Some(self.medium_path(label)),
            _ => None,
        };
        Ok(DriveState { loaded, mount_path })
    }

    fn load(&self, drive: &str, medium: &str, slot: u64) -> AdapterResult<()> {
        self.check_fault(drive, SimAction::Load)?;
        let mut state = self.lock_state();
        let occupied = state
            .drives
            .get(drive)
            .ok_or_else(|| no_drive(drive))?
            .loaded
            .is_some();
        if occupied {
            return Err(AdapterError::new(
                -libc::EBUSY,
                format!("drive {drive} is not empty"),
            ));
        }
        match state.slots.get(&slot) {
            Some(label) if label == medium => {}
            Some(label) => {
                return Err(AdapterError::new(
                    -libc::EINVAL,
                    format!("slot {slot} holds {label}, not {medium}"),
                ));
            }
            None => {
                return Err(AdapterError::new(
                    -libc::ENOENT,
                    format!("slot {slot} is empty"),
                ));
            }
        }
        state.slots.remove(&slot);
        if let Some(sim) = state.drives.get_mut(drive) {
            sim.loaded = Some((medium.to_string(), slot));
            sim.mounted = false;
        }
        self.save(&state)
    }

    fn unload(&self, drive: &str) -> AdapterResult<u64> {
        self.check_fault(drive, SimAction::Unload)?;
        let mut state = self.lock_state();
        let sim = state.drives.get_mut(drive).ok_or_else(|| no_drive(drive))?;
        if sim.mounted {
            return Err(AdapterError::new(
                -libc::EBUSY,
                format!("drive {drive} is still mounted"),
            ));
        }
        let (label, slot) = sim.loaded.take().ok_or_else(|| empty_drive(drive))?;
        state.slots.insert(slot, label);
        self.save(&state)?;
        Ok(slot)
    }

    fn mount(&self, drive: &str, fs: FsType) -> AdapterResult<PathBuf> {
        self.check_fault(drive, SimAction::Mount)?;
        let mut state = self.lock_state();
        let label = state
            .drives
            .get(drive)
            .ok_or_else(|| no_drive(drive))?
            .loaded
            .as_ref()
            .map(|(label, _)| label.clone())
            .ok_or_else(|| empty_drive(drive))?;
        match state.media.get(&label).and_then(|m| m.formatted) {
            Some(formatted) if formatted == fs => {}
            Some(formatted) => {
                return Err(AdapterError::new(
                    -libc::EINVAL,
                    format!("{label} holds {formatted}, not {fs}"),
                ));
            }
            None => {
                return Err(AdapterError::new(
                    -libc::EINVAL,
                    format!("{label} is not formatted"),
                ));
            }
        }
        let path = self.medium_path(&label);
        std::fs::create_dir_all(&path)
            .map_err(|e| AdapterError::new(-libc::EIO, format!("mount {label}: {e}")))?;
        if let Some(sim) = state.drives.get_mut(drive) {
            sim.mounted = true;
        }
        self.save(&state)?;
        Ok(path)
    }

    fn umount(&self, drive: &str) -> AdapterResult<()> {
        self.check_fault(drive, SimAction::Umount)?;
        let mut state = self.lock_state();
        let sim = state.drives.get_mut(drive).ok_or_else(|| no_drive(drive))?;
        if !sim.mounted {
            return Err(AdapterError::new(
                -libc::EINVAL,
                format!("drive {drive} is not mounted"),
            ));
        }
        sim.mounted = false;
        self.save(&state)
    }

    fn format(&self, drive: &str, fs: FsType, label: &str) -> AdapterResult<FsSpace> {
        self.check_fault(drive, SimAction::Format)?;
        let mut state = self.lock_state();
        let sim = state.drives.get(drive).ok_or_else(|| no_drive(drive))?;
        if sim.mounted {
            return Err(AdapterError::new(
                -libc::EBUSY,
                format!("drive {drive} is mounted"),
            ));
        }
        let loaded = sim
            .loaded
            .as_ref()
            .map(|(l, _)| l.clone())
            .ok_or_else(|| empty_drive(drive))?;
        if loaded != label {
            return Err(AdapterError::new(
                -libc::EINVAL,
                format!("drive {drive} holds {loaded}, not {label}"),
            ));
        }
        let path = self.medium_path(&loaded);
        if path.exists() {
            std::fs::remove_dir_all(&path)
                .map_err(|e| AdapterError::new(-libc::EIO, format!("format {loaded}: {e}")))?;
        }
        std::fs::create_dir_all(&path)
            .map_err(|e| AdapterError::new(-libc::EIO, format!("format {loaded}: {e}")))?;
        let medium = state
            .media
            .get_mut(&loaded)
            .ok_or_else(|| AdapterError::new(-libc::ENOENT, format!("unknown medium {loaded}")))?;
        medium.formatted = Some(fs);
        let capacity = medium.capacity;
        self.save(&state)?;
        Ok(FsSpace { capacity })
    }

    fn sync(&self, drive: &str) -> AdapterResult<()> {
        self.check_fault(drive, SimAction::Sync)?;
        let state = self.lock_state();
        let sim = state.drives.get(drive).ok_or_else(|| no_drive(drive))?;
        if !sim.mounted {
            return Err(AdapterError::new(
                -libc::EINVAL,
                format!("drive {drive} is not mounted"),
            ));
        }
        Ok(())
    }
}
