//! Dispatch loop.
//!
//! A single task owns the request queue. On every wake-up it walks the
//! pending requests in arrival order, asks the allocator for a
//! (device, medium) pair, claims both locks and hands the request to the
//! device worker. Contended requests back off exponentially and fail with
//! `Timeout` once they have waited longer than the configured limit.
//!
//! Requests that compete for the same medium, or writes of the same family,
//! are never reordered: once one of them cannot be served in a pass, the
//! ones behind it wait for the next pass.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tapegrid_alloc::{
    AllocError, Allocation, DeviceView, MediumView, WriteIntent, allocate_format, allocate_read,
    allocate_write, locked_keys, medium_views,
};
use tapegrid_core::config::LrsConfig;
use tapegrid_core::{
    CorrelationId, DeviceId, ErrorKind, LockOwner, LockTarget, Outcome, Request, Response,
};
use tapegrid_state::StateStore;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::client::{Control, Envelope, Mailbox};
use crate::device::DeviceRegistry;
use crate::worker::{Claim, DeviceCommand, Intent, WorkerEvent};

struct Pending {
    id: CorrelationId,
    request: Request,
    mailbox: Arc<Mailbox>,
    enqueued: Instant,
    backoff: Backoff,
    not_before: Option<Instant>,
}

impl Pending {
    /// Requests sharing a key are served in arrival order.
    fn order_key(&self) -> String {
        match &self.request {
            Request::Write { family, .. } => format!("write:{family}"),
            Request::Read { medium } | Request::Format { medium, .. } => medium.table_key(),
            Request::Release { grant, .. } => format!("release:{grant}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Preparing,
    Releasing,
}

struct InFlight {
    mailbox: Arc<Mailbox>,
    stage: Stage,
}

/// Catalog and device state for one scheduling pass.
struct Snapshot {
    devices: Vec<DeviceView>,
    media: Vec<MediumView>,
}

enum Attempt {
    Dispatched,
    Contended(String),
    Failed(ErrorKind),
}

pub(crate) struct Dispatcher {
    registry: Arc<DeviceRegistry>,
    catalog: StateStore,
    config: Arc<LrsConfig>,
    workers: HashMap<DeviceId, mpsc::Sender<DeviceCommand>>,
    ids: Arc<AtomicU64>,
    pending: VecDeque<Pending>,
    in_flight: HashMap<CorrelationId, InFlight>,
    /// Granted requests and the device holding their medium.
    grants: HashMap<CorrelationId, DeviceId>,
    /// Cancelled while their worker was already preparing them.
    cancelled: HashSet<CorrelationId>,
    /// Releases issued by the dispatcher itself for cancelled grants.
    internal_releases: HashSet<CorrelationId>,
}

impl Dispatcher {
    pub(crate) fn new(
        registry: Arc<DeviceRegistry>,
        catalog: StateStore,
        config: Arc<LrsConfig>,
        workers: HashMap<DeviceId, mpsc::Sender<DeviceCommand>>,
        ids: Arc<AtomicU64>,
    ) -> Self {
        Self {
            registry,
            catalog,
            config,
            workers,
            ids,
            pending: VecDeque::new(),
            in_flight: HashMap::new(),
            grants: HashMap::new(),
            cancelled: HashSet::new(),
            internal_releases: HashSet::new(),
        }
    }

    pub(crate) async fn run(
        mut self,
        mut submissions: mpsc::Receiver<Envelope>,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
        mut control: mpsc::UnboundedReceiver<Control>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(devices = self.workers.len(), "dispatcher started");
        loop {
            let wake = self.next_wake();
            tokio::select! {
                Some(envelope) = submissions.recv() => self.accept(envelope),
                Some(event) = events.recv() => self.on_event(event),
                Some(control) = control.recv() => self.on_control(control),
                _ = sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {}
                _ = shutdown.changed() => break,
            }
            self.schedule();
        }
        self.drain_on_shutdown();
        info!("dispatcher stopped");
    }

    // ── Inputs ─────────────────────────────────────────────────────

    fn accept(&mut self, envelope: Envelope) {
        let Envelope {
            id,
            request,
            mailbox,
        } = envelope;
        if let Request::Release {
            grant,
            size_written,
            status,
        } = request
        {
            self.release(id, grant, size_written, status, mailbox);
            return;
        }
        let backoff = Backoff::new(
            self.config.busy_backoff_min(),
            self.config.busy_backoff_max(),
        );
        self.pending.push_back(Pending {
            id,
            request,
            mailbox,
            enqueued: Instant::now(),
            backoff,
            not_before: None,
        });
    }

    fn release(
        &mut self,
        id: CorrelationId,
        grant: CorrelationId,
        size_written: u64,
        status: Option<ErrorKind>,
        mailbox: Arc<Mailbox>,
    ) {
        let Some(device) = self.grants.remove(&grant) else {
            warn!(request = id, grant, "release of unknown grant");
            mailbox.push(Response::error(id, ErrorKind::InvalidArgument));
            return;
        };
        let command = DeviceCommand::Release {
            id,
            grant,
            size_written,
            status,
        };
        if self.send(&device, command) {
            self.in_flight.insert(
                id,
                InFlight {
                    mailbox,
                    stage: Stage::Releasing,
                },
            );
        } else {
            mailbox.push(Response::error(id, ErrorKind::Cancelled));
        }
    }

    fn on_event(&mut self, event: WorkerEvent) {
        let (id, outcome) = match event {
            WorkerEvent::Ready { id, device, mount } => {
                if self.cancelled.remove(&id) {
                    self.in_flight.remove(&id);
                    self.release_internally(id, &device);
                    return;
                }
                self.grants.insert(id, device);
                (id, Outcome::Ready(mount))
            }
            WorkerEvent::Formatted { id, medium, .. } => (id, Outcome::Formatted { medium }),
            WorkerEvent::Released { id, medium, .. } => (id, Outcome::Released { medium }),
            WorkerEvent::Failed { id, kind, .. } => (id, Outcome::Error { kind }),
            WorkerEvent::ReleaseFailed {
                id,
                device,
                grant,
                kind,
            } => {
                warn!(request = id, grant, %device, %kind, "release refused, grant kept");
                self.grants.insert(grant, device);
                (id, Outcome::Error { kind })
            }
        };
        // A device or medium may have come free.
        self.wake_pending();

        if self.internal_releases.remove(&id) || self.cancelled.remove(&id) {
            self.in_flight.remove(&id);
            return;
        }
        match self.in_flight.remove(&id) {
            Some(flight) => flight.mailbox.push(Response { id, outcome }),
            None => warn!(request = id, "worker event for unknown request"),
        }
    }

    fn on_control(&mut self, control: Control) {
        match control {
            Control::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(id));
            }
        }
    }

    fn cancel(&mut self, id: CorrelationId) -> bool {
        if let Some(pos) = self.pending.iter().position(|p| p.id == id) {
            if let Some(pending) = self.pending.remove(pos) {
                pending.mailbox.push(Response::error(id, ErrorKind::Cancelled));
                debug!(request = id, "pending request cancelled");
                return true;
            }
        }
        match self.in_flight.get(&id) {
            Some(flight) if flight.stage == Stage::Preparing && !self.cancelled.contains(&id) => {
                flight.mailbox.push(Response::error(id, ErrorKind::Cancelled));
                self.cancelled.insert(id);
                debug!(request = id, "in-flight request cancelled");
                true
            }
            _ => false,
        }
    }

    fn release_internally(&mut self, grant: CorrelationId, device: &DeviceId) {
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        let command = DeviceCommand::Release {
            id,
            grant,
            size_written: 0,
            status: Some(ErrorKind::Cancelled),
        };
        if self.send(device, command) {
            self.internal_releases.insert(id);
            debug!(grant, %device, "releasing grant of cancelled request");
        }
    }

    // ── Scheduling ─────────────────────────────────────────────────

    fn next_wake(&self) -> Option<Instant> {
        self.pending.iter().filter_map(|p| p.not_before).min()
    }

    fn wake_pending(&mut self) {
        for pending in &mut self.pending {
            pending.not_before = None;
        }
    }

    /// One pass over the pending queue.
    fn schedule(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut snapshot: Option<Snapshot> = None;
        let mut remaining = VecDeque::with_capacity(self.pending.len());

        while let Some(mut pending) = self.pending.pop_front() {
            let key = pending.order_key();
            let waiting = pending.not_before.is_some_and(|t| t > now);
            if waiting || blocked.contains(&key) {
                blocked.insert(key);
                remaining.push_back(pending);
                continue;
            }

            if snapshot.is_none() {
                match self.snapshot() {
                    Ok(s) => snapshot = Some(s),
                    Err(kind) => {
                        warn!(%kind, "catalog unavailable, deferring scheduling");
                        self.defer(&mut pending, now);
                        blocked.insert(key);
                        remaining.push_back(pending);
                        continue;
                    }
                }
            }
            let Some(current) = snapshot.as_ref() else {
                remaining.push_back(pending);
                continue;
            };

            match self.attempt(&pending, current) {
                Attempt::Dispatched => {
                    // Locks changed; refresh before the next decision.
                    snapshot = None;
                }
                Attempt::Contended(reason) => {
                    if now.duration_since(pending.enqueued) >= self.config.busy_timeout() {
                        info!(request = pending.id, %reason, "request timed out");
                        pending
                            .mailbox
                            .push(Response::error(pending.id, ErrorKind::Timeout));
                        continue;
                    }
                    debug!(request = pending.id, %reason, "resources busy");
                    self.defer(&mut pending, now);
                    blocked.insert(key);
                    remaining.push_back(pending);
                }
                Attempt::Failed(kind) => {
                    debug!(request = pending.id, %kind, "request rejected");
                    pending.mailbox.push(Response::error(pending.id, kind));
                }
            }
        }
        self.pending = remaining;
    }

    fn defer(&self, pending: &mut Pending, now: Instant) {
        let delay = pending.backoff.next_delay();
        let deadline = pending.enqueued + self.config.busy_timeout();
        pending.not_before = Some((now + delay).min(deadline.max(now + Duration::from_millis(1))));
    }

    fn snapshot(&self) -> Result<Snapshot, ErrorKind> {
        let media = self.catalog.list_media().map_err(|e| e.kind())?;
        let locks = self.catalog.list_locks().map_err(|e| e.kind())?;
        Ok(Snapshot {
            devices: self.registry.views(),
            media: medium_views(&media, &locked_keys(&locks)),
        })
    }

    fn attempt(&mut self, pending: &Pending, snapshot: &Snapshot) -> Attempt {
        let (allocation, intent) = match self.allocate(&pending.request, snapshot) {
            Ok(found) => found,
            Err(AllocError::Busy(reason)) => return Attempt::Contended(reason),
            Err(e) => return Attempt::Failed(e.kind()),
        };
        let owner = LockOwner::new(self.config.hostname.clone(), format!("req-{}", pending.id));

        let device = match self
            .registry
            .claim(LockTarget::Device(allocation.device.clone()), &owner)
        {
            Ok(Some(guard)) => guard,
            Ok(None) => return Attempt::Contended(format!("{} is locked", allocation.device)),
            Err(e) => return Attempt::Failed(e.kind()),
        };
        let medium = match self
            .registry
            .claim(LockTarget::Medium(allocation.medium.clone()), &owner)
        {
            Ok(Some(guard)) => guard,
            Ok(None) => return Attempt::Contended(format!("{} is locked", allocation.medium)),
            Err(e) => return Attempt::Failed(e.kind()),
        };
        // The worker may have moved since the snapshot was taken.
        match self.registry.get(&allocation.device) {
            Ok(d) if d.status.is_stable() && !d.ongoing_io => {}
            Ok(d) => return Attempt::Contended(format!("{} is {}", allocation.device, d.status)),
            Err(e) => return Attempt::Failed(e.kind()),
        }

        let command = DeviceCommand::Prepare {
            id: pending.id,
            medium: allocation.medium.clone(),
            intent,
            claim: Claim { device, medium },
        };
        if !self.send(&allocation.device, command) {
            return Attempt::Failed(ErrorKind::Cancelled);
        }
        debug!(
            request = pending.id,
            kind = pending.request.kind_str(),
            device = %allocation.device,
            medium = %allocation.medium,
            loaded = allocation.loaded,
            "request dispatched"
        );
        self.in_flight.insert(
            pending.id,
            InFlight {
                mailbox: Arc::clone(&pending.mailbox),
                stage: Stage::Preparing,
            },
        );
        Attempt::Dispatched
    }

    fn allocate(
        &self,
        request: &Request,
        snapshot: &Snapshot,
    ) -> Result<(Allocation, Intent), AllocError> {
        let find = |medium: &tapegrid_core::MediumId| {
            snapshot
                .media
                .iter()
                .find(|m| m.id == *medium)
                .ok_or_else(|| AllocError::NoMedium(format!("{medium} is not in the catalog")))
        };
        match request {
            Request::Write { family, size, tags } => {
                let intent = WriteIntent {
                    family: *family,
                    size: *size,
                    tags,
                };
                allocate_write(&snapshot.devices, &snapshot.media, intent)
                    .map(|a| (a, Intent::Write))
            }
            Request::Read { medium } => {
                allocate_read(&snapshot.devices, find(medium)?).map(|a| (a, Intent::Read))
            }
            Request::Format { medium, fs, unlock } => {
                allocate_format(&snapshot.devices, find(medium)?).map(|a| {
                    (
                        a,
                        Intent::Format {
                            fs: *fs,
                            unlock: *unlock,
                        },
                    )
                })
            }
            Request::Release { .. } => Err(AllocError::InvalidArgument(
                "release is not allocated".into(),
            )),
        }
    }

    fn send(&self, device: &DeviceId, command: DeviceCommand) -> bool {
        let Some(worker) = self.workers.get(device) else {
            warn!(%device, "no worker for device");
            return false;
        };
        match worker.try_send(command) {
            Ok(()) => true,
            Err(e) => {
                warn!(%device, error = %e, "device worker unavailable");
                false
            }
        }
    }

    fn drain_on_shutdown(&mut self) {
        for pending in self.pending.drain(..) {
            pending
                .mailbox
                .push(Response::error(pending.id, ErrorKind::Cancelled));
        }
        for (id, flight) in self.in_flight.drain() {
            if !self.cancelled.contains(&id) && !self.internal_releases.contains(&id) {
                flight.mailbox.push(Response::error(id, ErrorKind::Cancelled));
            }
        }
    }
}
