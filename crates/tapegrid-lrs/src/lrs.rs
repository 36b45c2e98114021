//! Scheduler assembly: registry, device workers and dispatcher.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use tapegrid_core::config::LrsConfig;
use tapegrid_core::{
    DeviceId, DeviceStatus, ErrorKind, FsType, LockOwner, LockTarget, MediumId, Outcome, Request,
    Response,
};
use tapegrid_state::StateStore;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::adapter::DeviceAdapter;
use crate::backoff::retry_catalog;
use crate::client::{Control, Envelope, LrsClient};
use crate::device::{Device, DeviceRegistry};
use crate::dispatcher::Dispatcher;
use crate::error::{LrsError, LrsResult};
use crate::worker::{DeviceCommand, DeviceWorker};

/// Per-worker command queue depth. A worker holds at most one grant, so
/// only a prepare, its release and an admin reset can be queued at once.
const WORKER_QUEUE_DEPTH: usize = 8;

/// A running local resource scheduler.
///
/// Dropping it stops the dispatcher and the device workers; pending
/// requests are answered with `Cancelled`.
pub struct Lrs {
    config: Arc<LrsConfig>,
    registry: Arc<DeviceRegistry>,
    ids: Arc<AtomicU64>,
    submissions: mpsc::Sender<Envelope>,
    control: mpsc::UnboundedSender<Control>,
    workers: HashMap<DeviceId, mpsc::Sender<DeviceCommand>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Lrs {
    /// Start a scheduler for the devices of `config.hostname`.
    ///
    /// Locks left behind by a previous run on this host are released, and
    /// each drive is queried so that its in-memory state matches the
    /// hardware before any request is served.
    pub async fn start(
        catalog: StateStore,
        adapter: Arc<dyn DeviceAdapter>,
        config: LrsConfig,
    ) -> LrsResult<Self> {
        let config = Arc::new(config);
        let hostname = config.hostname.clone();

        let stale = retry_catalog(
            "release stale locks",
            config.catalog_retry_budget,
            config.catalog_backoff(),
            || catalog.unlock_all_for_host(&hostname),
        )
        .await?;
        if stale > 0 {
            warn!(host = %hostname, count = stale, "released stale locks");
        }

        let devices: Vec<Device> = retry_catalog(
            "list devices",
            config.catalog_retry_budget,
            config.catalog_backoff(),
            || catalog.list_devices(),
        )
        .await?
        .into_iter()
        .filter(|d| d.host == hostname)
        .map(Device::new)
        .collect();
        let registry = Arc::new(DeviceRegistry::new(catalog.clone(), devices));

        let (shutdown, _) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut workers = HashMap::new();
        let mut tasks = Vec::new();

        for device in registry.snapshot() {
            let (tx, rx) = mpsc::channel(WORKER_QUEUE_DEPTH);
            let mut worker = DeviceWorker::new(
                device.id().clone(),
                device.info.path.clone(),
                Arc::clone(&registry),
                Arc::clone(&adapter),
                catalog.clone(),
                Arc::clone(&config),
                events_tx.clone(),
            );
            if let Err(e) = worker.reset().await {
                // The device stays in `Error` until an admin reset succeeds.
                error!(device = %device.id(), error = %e, "initial device query failed");
            }
            tasks.push(tokio::spawn(worker.run(rx, shutdown.subscribe())));
            workers.insert(device.id().clone(), tx);
        }

        let ids = Arc::new(AtomicU64::new(1));
        let (submissions, submissions_rx) = mpsc::channel(config.queue_depth.max(1));
        let (control, control_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            catalog,
            Arc::clone(&config),
            workers.clone(),
            Arc::clone(&ids),
        );
        tasks.push(tokio::spawn(dispatcher.run(
            submissions_rx,
            events_rx,
            control_rx,
            shutdown.subscribe(),
        )));

        info!(host = %hostname, devices = registry.len(), "local resource scheduler started");
        Ok(Self {
            config,
            registry,
            ids,
            submissions,
            control,
            workers,
            shutdown,
            tasks,
        })
    }

    /// A new client with its own response mailbox.
    pub fn connect(&self) -> LrsClient {
        LrsClient::new(
            Arc::clone(&self.ids),
            self.submissions.clone(),
            self.control.clone(),
        )
    }

    pub fn hostname(&self) -> &str {
        &self.config.hostname
    }

    /// Snapshot of every managed device.
    pub fn devices(&self) -> Vec<Device> {
        self.registry.snapshot()
    }

    pub fn device(&self, id: &DeviceId) -> LrsResult<Device> {
        self.registry.get(id)
    }

    /// Format a blank medium and wait for the outcome.
    pub async fn format(&self, medium: &MediumId, fs: FsType, unlock: bool) -> LrsResult<MediumId> {
        let client = self.connect();
        let id = client.submit(Request::Format {
            medium: medium.clone(),
            fs,
            unlock,
        })?;
        match client.wait_for(id).await {
            Response {
                outcome: Outcome::Formatted { medium },
                ..
            } => Ok(medium),
            Response {
                outcome: Outcome::Error { kind },
                ..
            } => Err(LrsError::Failed(kind)),
            other => Err(LrsError::InvalidState(format!(
                "unexpected response to format: {:?}",
                other.outcome
            ))),
        }
    }

    /// Re-query a device, typically to bring it back from `Error`.
    pub async fn reset_device(&self, id: &DeviceId) -> LrsResult<DeviceStatus> {
        let worker = self
            .workers
            .get(id)
            .ok_or_else(|| LrsError::DeviceNotFound(id.to_string()))?;
        let owner = LockOwner::new(self.config.hostname.clone(), "admin-reset");
        let Some(guard) = self.registry.claim(LockTarget::Device(id.clone()), &owner)? else {
            return Err(LrsError::Failed(ErrorKind::Busy));
        };
        let (reply, rx) = oneshot::channel();
        worker
            .send(DeviceCommand::Reset { reply })
            .await
            .map_err(|_| LrsError::Stopped)?;
        let status = rx.await.map_err(|_| LrsError::Stopped)?;
        guard.release()?;
        status
    }

    /// Stop the dispatcher and device workers and wait for them.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "scheduler task panicked");
            }
        }
        info!(host = %self.config.hostname, "local resource scheduler stopped");
    }
}

impl Drop for Lrs {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl std::fmt::Debug for Lrs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lrs")
            .field("hostname", &self.config.hostname)
            .field("devices", &self.registry.len())
            .finish()
    }
}
