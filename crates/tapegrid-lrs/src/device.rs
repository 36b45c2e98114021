//! Device state model.
//!
//! The registry is an arena of devices indexed by stable position. Each
//! device record is only mutated by the worker that owns the device; the
//! dispatcher reads snapshots and takes locks. Locks live in the catalog,
//! which is the source of truth shared with other schedulers; the registry
//! mirrors the holder of each device lock for cheap allocation views.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tapegrid_alloc::DeviceView;
use tapegrid_core::{DeviceId, DeviceStatus, LockOwner, LockTarget, MediumId};
use tapegrid_state::{DeviceInfo, StateStore};
use tracing::{debug, warn};

use crate::error::{LrsError, LrsResult};

/// In-memory state of one drive.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub info: DeviceInfo,
    pub status: DeviceStatus,
    pub loaded: Option<MediumId>,
    pub mount_path: Option<PathBuf>,
    pub lock_holder: Option<LockOwner>,
    /// Data was written since the last filesystem sync.
    pub needs_sync: bool,
    /// A granted medium is being read or written by a client.
    pub ongoing_io: bool,
}

impl Device {
    pub fn new(info: DeviceInfo) -> Self {
        Self {
            info,
            status: DeviceStatus::Empty,
            loaded: None,
            mount_path: None,
            lock_holder: None,
            needs_sync: false,
            ongoing_io: false,
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.info.id
    }

    /// Drive model, used as the technology tag.
    pub fn technology(&self) -> Option<&str> {
        self.info.model.as_deref()
    }

    pub fn view(&self, index: usize) -> DeviceView {
        DeviceView {
            id: self.info.id.clone(),
            index,
            status: self.status,
            adm_status: self.info.adm_status,
            loaded: self.loaded.clone(),
            locked: self.lock_holder.is_some() || self.ongoing_io,
        }
    }
}

pub struct DeviceRegistry {
    catalog: StateStore,
    devices: Vec<RwLock<Device>>,
    index: HashMap<DeviceId, usize>,
}

impl DeviceRegistry {
    pub fn new(catalog: StateStore, devices: Vec<Device>) -> Self {
        let index = devices
            .iter()
            .enumerate()
            .map(|(i, d)| (d.id().clone(), i))
            .collect();
        Self {
            catalog,
            devices: devices.into_iter().map(RwLock::new).collect(),
            index,
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn slot(&self, id: &DeviceId) -> LrsResult<&RwLock<Device>> {
        self.index
            .get(id)
            .map(|&i| &self.devices[i])
            .ok_or_else(|| LrsError::DeviceNotFound(id.to_string()))
    }

    /// Snapshot of one device.
    pub fn get(&self, id: &DeviceId) -> LrsResult<Device> {
        let slot = self.slot(id)?;
        Ok(slot.read().unwrap_or_else(PoisonError::into_inner).clone())
    }

    /// Apply `f` to a device under its write lock.
    pub fn update<R>(&self, id: &DeviceId, f: impl FnOnce(&mut Device) -> R) -> LrsResult<R> {
        let slot = self.slot(id)?;
        let mut device = slot.write().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&mut device))
    }

    pub fn set_status(&self, id: &DeviceId, status: DeviceStatus) -> LrsResult<()> {
        let previous = self.update(id, |d| std::mem::replace(&mut d.status, status))?;
        if previous != status {
            debug!(device = %id, from = %previous, to = %status, "device status");
        }
        Ok(())
    }

    pub fn set_loaded_medium(&self, id: &DeviceId, medium: Option<MediumId>) -> LrsResult<()> {
        self.update(id, |d| d.loaded = medium)
    }

    /// Take a lock without blocking. Device locks are mirrored into the
    /// device record.
    pub fn try_lock(&self, target: &LockTarget, owner: &LockOwner) -> LrsResult<bool> {
        if let LockTarget::Device(id) = target {
            // Unknown devices are not ours to lock.
            self.slot(id)?;
        }
        let acquired = self.catalog.try_lock(target, owner)?;
        if acquired {
            if let LockTarget::Device(id) = target {
                self.update(id, |d| d.lock_holder = Some(owner.clone()))?;
            }
        }
        Ok(acquired)
    }

    pub fn unlock(&self, target: &LockTarget, owner: &LockOwner) -> LrsResult<bool> {
        let released = self.catalog.unlock(target, owner)?;
        if let LockTarget::Device(id) = target {
            self.update(id, |d| {
                if d.lock_holder.as_ref() == Some(owner) {
                    d.lock_holder = None;
                }
            })?;
        }
        Ok(released)
    }

    /// Take a lock held for as long as the returned guard lives.
    /// `Ok(None)` means someone else holds it.
    pub fn claim(
        self: &Arc<Self>,
        target: LockTarget,
        owner: &LockOwner,
    ) -> LrsResult<Option<ResourceGuard>> {
        if !self.try_lock(&target, owner)? {
            return Ok(None);
        }
        Ok(Some(ResourceGuard {
            registry: Arc::clone(self),
            target,
            owner: owner.clone(),
            armed: true,
        }))
    }

    pub fn snapshot(&self) -> Vec<Device> {
        self.devices
            .iter()
            .map(|d| d.read().unwrap_or_else(PoisonError::into_inner).clone())
            .collect()
    }

    pub fn views(&self) -> Vec<DeviceView> {
        self.devices
            .iter()
            .enumerate()
            .map(|(i, d)| d.read().unwrap_or_else(PoisonError::into_inner).view(i))
            .collect()
    }
}

/// A held lock, released when dropped.
#[derive(Debug)]
pub struct ResourceGuard {
    registry: Arc<DeviceRegistry>,
    target: LockTarget,
    owner: LockOwner,
    armed: bool,
}

impl ResourceGuard {
    pub fn target(&self) -> &LockTarget {
        &self.target
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    /// Release now, surfacing catalog errors instead of logging them.
    pub fn release(mut self) -> LrsResult<()> {
        self.armed = false;
        self.registry.unlock(&self.target, &self.owner)?;
        Ok(())
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.registry.unlock(&self.target, &self.owner) {
            warn!(target = %self.target, owner = %self.owner, error = %e, "failed to release lock");
        }
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.devices.len())
            .finish()
    }
}
