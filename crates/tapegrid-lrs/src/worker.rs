//! Per-device worker.
//!
//! Each managed drive gets one task that runs every physical action for
//! that drive, one command at a time:
//!
//! ```text
//! Empty ─load─▶ Loaded ─mount─▶ Mounted ─(grant … release)─▶ Mounted
//!   ▲                                │
//!   └──unload── Loaded ◀──umount─────┘        any adapter failure ─▶ Error
//! ```
//!
//! A grant keeps the dispatcher's claim (device and medium locks) alive
//! until the matching release; dropping the claim unlocks both.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tapegrid_core::config::LrsConfig;
use tapegrid_core::{
    AdminStatus, CorrelationId, DeviceId, DeviceStatus, ErrorKind, FsStatus, FsType, MediumId,
    MountInfo, epoch_secs,
};
use tapegrid_state::{LogCause, MediumInfo, MediumLocation, StateStore};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::adapter::{AdapterError, AdapterResult, DeviceAdapter};
use crate::audit::AuditLog;
use crate::backoff::retry_catalog;
use crate::device::{DeviceRegistry, ResourceGuard};
use crate::error::{LrsError, LrsResult};

/// Locks taken by the dispatcher for one request.
#[derive(Debug)]
pub(crate) struct Claim {
    pub device: ResourceGuard,
    pub medium: ResourceGuard,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Intent {
    Write,
    Read,
    Format { fs: FsType, unlock: bool },
}

pub(crate) enum DeviceCommand {
    Prepare {
        id: CorrelationId,
        medium: MediumId,
        intent: Intent,
        claim: Claim,
    },
    Release {
        id: CorrelationId,
        grant: CorrelationId,
        size_written: u64,
        status: Option<ErrorKind>,
    },
    Reset {
        reply: oneshot::Sender<LrsResult<DeviceStatus>>,
    },
}

#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Ready {
        id: CorrelationId,
        device: DeviceId,
        mount: MountInfo,
    },
    Formatted {
        id: CorrelationId,
        device: DeviceId,
        medium: MediumId,
    },
    Released {
        id: CorrelationId,
        device: DeviceId,
        medium: MediumId,
    },
    Failed {
        id: CorrelationId,
        device: DeviceId,
        kind: ErrorKind,
    },
    /// The release could not be booked in the catalog; `grant` is still
    /// held and may be released again.
    ReleaseFailed {
        id: CorrelationId,
        device: DeviceId,
        grant: CorrelationId,
        kind: ErrorKind,
    },
}

/// A medium handed out to a client.
struct Grant {
    id: CorrelationId,
    medium: MediumId,
    claim: Claim,
}

pub(crate) struct DeviceWorker {
    id: DeviceId,
    /// Adapter address of the drive.
    drive: String,
    registry: Arc<DeviceRegistry>,
    adapter: Arc<dyn DeviceAdapter>,
    catalog: StateStore,
    audit: AuditLog,
    config: Arc<LrsConfig>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    grant: Option<Grant>,
}

impl DeviceWorker {
    pub(crate) fn new(
        id: DeviceId,
        drive: String,
        registry: Arc<DeviceRegistry>,
        adapter: Arc<dyn DeviceAdapter>,
        catalog: StateStore,
        config: Arc<LrsConfig>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            id,
            drive,
            registry,
            adapter,
            audit: AuditLog::new(catalog.clone()),
            catalog,
            config,
            events,
            grant: None,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<DeviceCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        if let Some(grant) = self.grant.take() {
            warn!(device = %self.id, grant = grant.id, "worker stopping with an active grant");
        }
        debug!(device = %self.id, "device worker stopped");
    }

    async fn handle(&mut self, command: DeviceCommand) {
        match command {
            DeviceCommand::Prepare {
                id,
                medium,
                intent,
                claim,
            } => {
                let event = match self.prepare(id, &medium, intent, claim).await {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(device = %self.id, %medium, request = id, error = %e, "request failed");
                        self.failed(id, e.kind())
                    }
                };
                self.emit(event);
            }
            DeviceCommand::Release {
                id,
                grant,
                size_written,
                status,
            } => {
                let event = self.release(id, grant, size_written, status).await;
                self.emit(event);
            }
            DeviceCommand::Reset { reply } => {
                let _ = reply.send(self.reset().await);
            }
        }
    }

    fn failed(&self, id: CorrelationId, kind: ErrorKind) -> WorkerEvent {
        WorkerEvent::Failed {
            id,
            device: self.id.clone(),
            kind,
        }
    }

    fn emit(&self, event: WorkerEvent) {
        if self.events.send(event).is_err() {
            debug!(device = %self.id, "dispatcher gone, dropping event");
        }
    }

    // ── Requests ───────────────────────────────────────────────────

    async fn prepare(
        &mut self,
        id: CorrelationId,
        medium_id: &MediumId,
        intent: Intent,
        claim: Claim,
    ) -> LrsResult<WorkerEvent> {
        if let Some(grant) = &self.grant {
            return Err(LrsError::InvalidState(format!(
                "{} is granted to request {}",
                self.id, grant.id
            )));
        }
        let medium = self.load_medium_record(medium_id).await?;
        self.ensure_loaded(&medium).await?;

        match intent {
            Intent::Format { fs, unlock } => {
                let capacity = self.format(&medium, fs).await?;
                let name = medium.id.name.clone();
                let drive_name = self.id.name.clone();
                self.update_medium(medium_id, move |m| {
                    m.fs.fs_type = fs;
                    m.fs.status = FsStatus::Formatted;
                    m.fs.label = Some(name.clone());
                    m.capacity = capacity;
                    m.used = 0;
                    m.nb_obj = 0;
                    m.location = MediumLocation::Drive(drive_name.clone());
                    if unlock {
                        m.adm_status = AdminStatus::Unlocked;
                    }
                })
                .await?;
                drop(claim);
                info!(device = %self.id, medium = %medium_id, %fs, unlock, "medium formatted");
                Ok(WorkerEvent::Formatted {
                    id,
                    device: self.id.clone(),
                    medium: medium_id.clone(),
                })
            }
            Intent::Write | Intent::Read => {
                let mount_path = self.ensure_mounted(&medium).await?;
                let now = epoch_secs();
                let medium = self
                    .update_medium(medium_id, move |m| m.last_access = now)
                    .await?;
                self.registry.update(&self.id, |d| d.ongoing_io = true)?;
                self.grant = Some(Grant {
                    id,
                    medium: medium.id.clone(),
                    claim,
                });
                debug!(device = %self.id, medium = %medium.id, request = id, ?intent, "medium granted");
                Ok(WorkerEvent::Ready {
                    id,
                    device: self.id.clone(),
                    mount: MountInfo {
                        device: self.id.clone(),
                        medium: medium.id.clone(),
                        mount_path,
                        fs_type: medium.fs.fs_type,
                        avail: medium.free(),
                    },
                })
            }
        }
    }

    async fn release(
        &mut self,
        id: CorrelationId,
        grant_id: CorrelationId,
        size_written: u64,
        status: Option<ErrorKind>,
    ) -> WorkerEvent {
        let grant = match self.grant.take() {
            Some(grant) if grant.id == grant_id => grant,
            other => {
                self.grant = other;
                warn!(device = %self.id, grant = grant_id, "release of unknown grant");
                return self.failed(id, ErrorKind::InvalidArgument);
            }
        };
        if let Some(kind) = status {
            warn!(device = %self.id, medium = %grant.medium, grant = grant_id, %kind, "client reported I/O failure");
        }

        let mut outcome: LrsResult<()> = Ok(());
        if size_written > 0 {
            let _ = self.registry.update(&self.id, |d| d.needs_sync = true);
        }
        let needs_sync = self
            .registry
            .get(&self.id)
            .map(|d| d.needs_sync)
            .unwrap_or(false);
        if needs_sync && self.config.sync_on_release {
            outcome = self.sync(&grant.medium).await;
        }

        // The catalog must reflect the write before the medium is unlocked.
        // Otherwise the grant and its locks stay until a release succeeds.
        let now = epoch_secs();
        let recorded = self
            .update_medium(&grant.medium, move |m| {
                m.record_write(size_written);
                m.last_access = now;
            })
            .await;
        if let Err(e) = recorded {
            error!(device = %self.id, medium = %grant.medium, grant = grant_id, error = %e, "release not recorded, medium stays locked");
            self.grant = Some(grant);
            return WorkerEvent::ReleaseFailed {
                id,
                device: self.id.clone(),
                grant: grant_id,
                kind: e.kind(),
            };
        }

        let _ = self.registry.update(&self.id, |d| d.ongoing_io = false);
        let medium = grant.medium.clone();
        drop(grant.claim);

        match outcome {
            Ok(()) => {
                debug!(device = %self.id, %medium, size_written, "medium released");
                WorkerEvent::Released {
                    id,
                    device: self.id.clone(),
                    medium,
                }
            }
            Err(e) => {
                error!(device = %self.id, %medium, error = %e, "release failed");
                self.failed(id, e.kind())
            }
        }
    }

    /// Re-query the drive and rejoin `Empty`, `Loaded` or `Mounted`.
    pub(crate) async fn reset(&mut self) -> LrsResult<DeviceStatus> {
        if let Some(grant) = &self.grant {
            return Err(LrsError::InvalidState(format!(
                "{} is granted to request {}",
                self.id, grant.id
            )));
        }
        let drive = self.drive.clone();
        let result = self.call(move |a| a.query_status(&drive)).await;
        self.audit.record(
            &self.id,
            None,
            LogCause::Query,
            &result,
            json!({ "drive": self.drive }),
        );
        let state = result.map_err(|e| self.fault(e))?;

        let loaded = state
            .loaded
            .map(|label| MediumId::new(self.id.family, label));
        let status = match (&loaded, &state.mount_path) {
            (None, _) => DeviceStatus::Empty,
            (Some(_), Some(_)) => DeviceStatus::Mounted,
            (Some(_), None) => DeviceStatus::Loaded,
        };
        let mount_path = state.mount_path;
        let medium = loaded.clone();
        self.registry.update(&self.id, |d| {
            d.status = status;
            d.loaded = medium;
            d.mount_path = mount_path;
            d.needs_sync = false;
            d.ongoing_io = false;
        })?;
        if let Some(medium) = &loaded {
            let drive_name = self.id.name.clone();
            match self
                .update_medium(medium, move |m| {
                    m.location = MediumLocation::Drive(drive_name.clone())
                })
                .await
            {
                Ok(_) => {}
                Err(LrsError::State(e)) if e.kind() == ErrorKind::NotFound => {
                    warn!(device = %self.id, %medium, "loaded medium is unknown to the catalog");
                }
                Err(e) => return Err(e),
            }
        }
        info!(device = %self.id, %status, medium = ?loaded.map(|m| m.name), "device state refreshed");
        Ok(status)
    }

    // ── Physical actions ───────────────────────────────────────────

    async fn ensure_loaded(&mut self, medium: &MediumInfo) -> LrsResult<()> {
        let device = self.registry.get(&self.id)?;
        if device.loaded.as_ref() == Some(&medium.id) {
            return Ok(());
        }
        if device.loaded.is_some() {
            self.unload_current().await?;
        }
        let slot = match &medium.location {
            MediumLocation::Slot(slot) => *slot,
            MediumLocation::Drive(other) => {
                return Err(LrsError::InvalidState(format!(
                    "{} is loaded in drive {other}",
                    medium.id
                )));
            }
        };

        self.registry.set_status(&self.id, DeviceStatus::Loading)?;
        let budget = self.config.load_retry_budget;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let drive = self.drive.clone();
            let label = medium.id.name.clone();
            let result = self.call(move |a| a.load(&drive, &label, slot)).await;
            self.audit.record(
                &self.id,
                Some(&medium.id),
                LogCause::DeviceLoad,
                &result,
                json!({ "drive": self.drive, "slot": slot, "attempt": attempt }),
            );
            match result {
                Ok(()) => break,
                Err(e) if e.is_invalid_move() && attempt <= budget => {
                    warn!(device = %self.id, medium = %medium.id, attempt, budget, "load rejected, retrying");
                }
                Err(e) => return Err(self.fault(e)),
            }
        }

        let loaded = medium.id.clone();
        self.registry.update(&self.id, |d| {
            d.status = DeviceStatus::Loaded;
            d.loaded = Some(loaded);
            d.mount_path = None;
        })?;
        let drive_name = self.id.name.clone();
        self.update_medium(&medium.id, move |m| {
            m.location = MediumLocation::Drive(drive_name.clone())
        })
            .await?;
        Ok(())
    }

    async fn unload_current(&mut self) -> LrsResult<()> {
        let device = self.registry.get(&self.id)?;
        let Some(current) = device.loaded else {
            return Ok(());
        };
        if device.mount_path.is_some() {
            self.umount(&current).await?;
        }

        self.registry.set_status(&self.id, DeviceStatus::Unloading)?;
        let drive = self.drive.clone();
        let result = self.call(move |a| a.unload(&drive)).await;
        self.audit.record(
            &self.id,
            Some(&current),
            LogCause::DeviceUnload,
            &result,
            json!({ "drive": self.drive }),
        );
        let slot = result.map_err(|e| self.fault(e))?;

        self.registry.update(&self.id, |d| {
            d.status = DeviceStatus::Empty;
            d.loaded = None;
            d.needs_sync = false;
        })?;
        self.update_medium(&current, move |m| m.location = MediumLocation::Slot(slot))
            .await?;
        Ok(())
    }

    async fn ensure_mounted(&mut self, medium: &MediumInfo) -> LrsResult<PathBuf> {
        let device = self.registry.get(&self.id)?;
        if let Some(path) = device.mount_path {
            return Ok(path);
        }

        self.registry.set_status(&self.id, DeviceStatus::Mounting)?;
        let drive = self.drive.clone();
        let fs = medium.fs.fs_type;
        let result = self.call(move |a| a.mount(&drive, fs)).await;
        self.audit.record(
            &self.id,
            Some(&medium.id),
            LogCause::Mount,
            &result,
            json!({ "drive": self.drive, "fs": fs }),
        );
        let path = result.map_err(|e| self.fault(e))?;

        let mount_path = path.clone();
        self.registry.update(&self.id, |d| {
            d.status = DeviceStatus::Mounted;
            d.mount_path = Some(mount_path);
        })?;
        Ok(path)
    }

    async fn umount(&mut self, medium: &MediumId) -> LrsResult<()> {
        self.registry.set_status(&self.id, DeviceStatus::Unmounting)?;
        let drive = self.drive.clone();
        let result = self.call(move |a| a.umount(&drive)).await;
        self.audit.record(
            &self.id,
            Some(medium),
            LogCause::Umount,
            &result,
            json!({ "drive": self.drive }),
        );
        result.map_err(|e| self.fault(e))?;

        self.registry.update(&self.id, |d| {
            d.status = DeviceStatus::Loaded;
            d.mount_path = None;
        })?;
        Ok(())
    }

    /// Format the loaded medium. Returns its capacity.
    async fn format(&mut self, medium: &MediumInfo, fs: FsType) -> LrsResult<u64> {
        if self.registry.get(&self.id)?.mount_path.is_some() {
            self.umount(&medium.id).await?;
        }
        let drive = self.drive.clone();
        let label = medium.id.name.clone();
        let result = self.call(move |a| a.format(&drive, fs, &label)).await;
        self.audit.record(
            &self.id,
            Some(&medium.id),
            LogCause::Format,
            &result,
            json!({ "drive": self.drive, "fs": fs }),
        );
        let space = result.map_err(|e| self.fault(e))?;
        self.registry.set_status(&self.id, DeviceStatus::Loaded)?;
        Ok(space.capacity)
    }

    async fn sync(&mut self, medium: &MediumId) -> LrsResult<()> {
        let drive = self.drive.clone();
        let result = self.call(move |a| a.sync(&drive)).await;
        self.audit.record(
            &self.id,
            Some(medium),
            LogCause::Sync,
            &result,
            json!({ "drive": self.drive }),
        );
        result.map_err(|e| self.fault(e))?;
        self.registry.update(&self.id, |d| d.needs_sync = false)?;
        Ok(())
    }

    // ── Helpers ────────────────────────────────────────────────────

    /// Run a blocking adapter call off the async executor.
    async fn call<T, F>(&self, op: F) -> AdapterResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn DeviceAdapter) -> AdapterResult<T> + Send + 'static,
    {
        let adapter = Arc::clone(&self.adapter);
        tokio::task::spawn_blocking(move || op(adapter.as_ref()))
            .await
            .unwrap_or_else(|e| {
                Err(AdapterError::new(
                    -libc::EIO,
                    format!("adapter task failed: {e}"),
                ))
            })
    }

    /// Move the device to `Error` and wrap the adapter failure.
    fn fault(&self, source: AdapterError) -> LrsError {
        let _ = self.registry.update(&self.id, |d| {
            d.status = DeviceStatus::Error;
            d.ongoing_io = false;
        });
        error!(device = %self.id, errno = source.code, error = %source.message, "device moved to error state");
        LrsError::Adapter {
            device: self.id.to_string(),
            source,
        }
    }

    async fn load_medium_record(&self, id: &MediumId) -> LrsResult<MediumInfo> {
        retry_catalog(
            "get medium",
            self.config.catalog_retry_budget,
            self.config.catalog_backoff(),
            || self.catalog.get_medium(id),
        )
        .await?
        .ok_or_else(|| LrsError::MediumNotFound(id.to_string()))
    }

    async fn update_medium<F>(&self, id: &MediumId, update: F) -> LrsResult<MediumInfo>
    where
        F: Fn(&mut MediumInfo),
    {
        retry_catalog(
            "update medium",
            self.config.catalog_retry_budget,
            self.config.catalog_backoff(),
            || self.catalog.update_medium(id, &update),
        )
        .await
    }
}
