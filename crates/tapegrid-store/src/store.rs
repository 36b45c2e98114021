//! The object store: batch transfers over one scheduler.

use tapegrid_core::{TapegridConfig, epoch_secs};
use tapegrid_layout::{Encoder, EncoderKind, LayoutOptions, Transfer, XferOp, locate};
use tapegrid_lrs::{Lrs, LrsClient, retry_catalog};
use tapegrid_state::{ExtentState, LayoutInfo, ObjectInfo, ObjectStatus, StateResult, StateStore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batch::{Batch, Job};
use crate::error::{StoreError, StoreResult};

/// Version given to newly stored objects.
const FIRST_VERSION: u32 = 1;

/// Entry point for putting, getting and deleting objects.
///
/// Each batch call drives its transfers concurrently and returns the first
/// error met, after invoking `callback(transfer, rc)` exactly once per
/// transfer (`rc` is 0 or a negative errno). Transfers rejected before any
/// I/O is attempted are reported once the rest of the batch has drained.
pub struct ObjectStore {
    client: LrsClient,
    catalog: StateStore,
    hostname: String,
    pub(crate) config: TapegridConfig,
}

impl ObjectStore {
    pub fn new(lrs: &Lrs, catalog: StateStore, config: TapegridConfig) -> Self {
        Self {
            client: lrs.connect(),
            catalog,
            hostname: lrs.hostname().to_string(),
            config,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn catalog(&self) -> &StateStore {
        &self.catalog
    }

    /// Store new objects. Each transfer's file supplies `size` bytes.
    pub async fn put<F>(&self, xfers: &mut [Transfer], mut callback: F) -> StoreResult<()>
    where
        F: FnMut(&Transfer, i32),
    {
        let mut rejected = Vec::new();
        let mut batch = Batch::new(self, self.client.split(), &mut callback);
        for (index, xfer) in xfers.iter_mut().enumerate() {
            match self.start_put(xfer) {
                Ok(job) => batch.push(job),
                Err(e) => rejected.push((index, e)),
            }
        }
        let first = batch.run().await;
        report_rejected(xfers, rejected, &mut callback, first)
    }

    /// Read objects into each transfer's file.
    pub async fn get<F>(&self, xfers: &mut [Transfer], mut callback: F) -> StoreResult<()>
    where
        F: FnMut(&Transfer, i32),
    {
        let mut rejected = Vec::new();
        let mut batch = Batch::new(self, self.client.split(), &mut callback);
        for (index, xfer) in xfers.iter_mut().enumerate() {
            match self.start_get(xfer) {
                Ok(job) => batch.push(job),
                Err(e) => rejected.push((index, e)),
            }
        }
        let first = batch.run().await;
        report_rejected(xfers, rejected, &mut callback, first)
    }

    /// Remove objects and their extents.
    pub async fn delete<F>(&self, xfers: &mut [Transfer], mut callback: F) -> StoreResult<()>
    where
        F: FnMut(&Transfer, i32),
    {
        let mut rejected = Vec::new();
        let mut batch = Batch::new(self, self.client.split(), &mut callback);
        for (index, xfer) in xfers.iter_mut().enumerate() {
            match self.start_delete(xfer) {
                Ok(job) => batch.push(job),
                Err(e) => rejected.push((index, e)),
            }
        }
        let first = batch.run().await;
        report_rejected(xfers, rejected, &mut callback, first)
    }

    /// Fill each transfer's size and attributes from the catalog. The
    /// scheduler is not involved.
    pub fn get_metadata<F>(&self, xfers: &mut [Transfer], mut callback: F) -> StoreResult<()>
    where
        F: FnMut(&Transfer, i32),
    {
        let mut first = None;
        for xfer in xfers.iter_mut() {
            let result = self.fill_metadata(xfer);
            let rc = settle(xfer, result.as_ref().map(|_| ()).map_err(StoreError::kind));
            callback(&*xfer, rc);
            if let Err(e) = result {
                debug!(oid = %xfer.oid, error = %e, "metadata lookup failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Host best placed to read `oid`; `focus_host` defaults to this one.
    pub fn locate(&self, oid: &str, focus_host: Option<&str>) -> StoreResult<String> {
        self.complete_object(oid)?;
        let layout = self.layout_of(oid)?;
        Ok(locate(&self.catalog, &layout, focus_host.unwrap_or(&self.hostname))?)
    }

    // ── Transfer setup ─────────────────────────────────────────────

    fn start_put<'x>(&self, xfer: &'x mut Transfer) -> StoreResult<Job<'x>> {
        check(xfer, XferOp::Put)?;
        if xfer.file.is_none() {
            return Err(StoreError::InvalidArgument(format!("put {}: no source file", xfer.oid)));
        }
        let options = LayoutOptions::resolve(xfer, &self.config.store, &self.config.io);
        let now = epoch_secs();
        let object = ObjectInfo {
            oid: xfer.oid.clone(),
            uuid: Uuid::new_v4().to_string(),
            version: FIRST_VERSION,
            user_md: xfer.attrs.clone(),
            status: ObjectStatus::Incomplete,
            size: xfer.size,
            created_at: now,
            access_time: now,
        };
        self.catalog.reserve_object(&object)?;
        debug!(oid = %object.oid, uuid = %object.uuid, size = object.size, "object reserved for put");

        match Encoder::encode(xfer, &object.uuid, object.version, options) {
            Ok(encoder) => Ok(Job { encoder, object }),
            Err(e) => {
                if let Err(rollback) = self.catalog.delete_object(&object.oid) {
                    error!(oid = %object.oid, error = %rollback, "could not roll back reservation");
                }
                Err(e.into())
            }
        }
    }

    fn start_get<'x>(&self, xfer: &'x mut Transfer) -> StoreResult<Job<'x>> {
        check(xfer, XferOp::Get)?;
        let object = self.complete_object(&xfer.oid)?;
        let layout = self.layout_of(&xfer.oid)?;
        if xfer.flags.best_host {
            let host = locate(&self.catalog, &layout, &self.hostname)?;
            if host != self.hostname {
                return Err(StoreError::Remote {
                    oid: xfer.oid.clone(),
                    host,
                });
            }
        }
        xfer.size = object.size;
        let options = self.read_options(&layout);
        let encoder = Encoder::decode(xfer, Some(layout), options)?;
        Ok(Job { encoder, object })
    }

    fn start_delete<'x>(&self, xfer: &'x mut Transfer) -> StoreResult<Job<'x>> {
        check(xfer, XferOp::Delete)?;
        let object = self.complete_object(&xfer.oid)?;
        let layout = self.layout_of(&xfer.oid)?;
        let options = self.read_options(&layout);
        let encoder = Encoder::delete(xfer, Some(layout), options)?;
        Ok(Job { encoder, object })
    }

    fn fill_metadata(&self, xfer: &mut Transfer) -> StoreResult<()> {
        check(xfer, XferOp::GetMetadata)?;
        let object = self.complete_object(&xfer.oid)?;
        if let Some(layout) = self.catalog.get_layout(&xfer.oid)? {
            xfer.layout = Some(layout.kind);
        }
        xfer.size = object.size;
        xfer.attrs = object.user_md;
        Ok(())
    }

    /// Options for reading an existing layout: its own kind, and the block
    /// size of the family holding its extents.
    fn read_options(&self, layout: &LayoutInfo) -> LayoutOptions {
        let family = layout
            .extents
            .first()
            .map(|e| e.medium.family)
            .unwrap_or(self.config.store.default_family);
        LayoutOptions {
            layout: layout.kind,
            family,
            block_size: self.config.io.block_size(family),
        }
    }

    /// A readable object. Puts still in flight are invisible.
    fn complete_object(&self, oid: &str) -> StoreResult<ObjectInfo> {
        match self.catalog.get_object(oid)? {
            Some(object) if object.status == ObjectStatus::Complete => Ok(object),
            _ => Err(StoreError::NotFound(oid.to_string())),
        }
    }

    fn layout_of(&self, oid: &str) -> StoreResult<LayoutInfo> {
        self.catalog
            .get_layout(oid)?
            .ok_or_else(|| StoreError::MissingLayout { oid: oid.to_string() })
    }

    // ── Commit and rollback ────────────────────────────────────────

    async fn retry<T>(&self, what: &str, op: impl FnMut() -> StateResult<T>) -> StoreResult<T> {
        let lrs = &self.config.lrs;
        Ok(retry_catalog(what, lrs.catalog_retry_budget, lrs.catalog_backoff(), op).await?)
    }

    /// Record a finished transfer in the catalog.
    pub(crate) async fn commit(&self, job: &mut Job<'_>) -> StoreResult<()> {
        let oid = job.object.oid.clone();
        match job.encoder.kind() {
            EncoderKind::Encoder => {
                let layout = job.encoder.layout().clone();
                self.retry("save layout", || self.catalog.put_layout(&layout))
                    .await?;
                job.object.status = ObjectStatus::Complete;
                job.object.size = layout.size;
                job.object.access_time = epoch_secs();
                let object = job.object.clone();
                self.retry("complete object", || self.catalog.put_object(&object))
                    .await?;
                info!(%oid, size = layout.size, extents = layout.extents.len(), layout = %layout.kind, "object stored");
            }
            EncoderKind::Decoder => {
                let now = epoch_secs();
                let refreshed = self
                    .retry("refresh access time", || match self.catalog.get_object(&oid)? {
                        Some(mut object) => {
                            object.access_time = now;
                            self.catalog.put_object(&object).map(|()| true)
                        }
                        None => Ok(false),
                    })
                    .await;
                match refreshed {
                    Ok(true) => {}
                    Ok(false) => warn!(%oid, "object deleted while being read"),
                    Err(e) => warn!(%oid, error = %e, "could not refresh access time"),
                }
                info!(%oid, size = job.object.size, "object retrieved");
            }
            EncoderKind::Eraser => {
                self.retry("delete layout", || self.catalog.delete_layout(&oid))
                    .await?;
                self.retry("delete object", || self.catalog.delete_object(&oid))
                    .await?;
                info!(%oid, "object deleted");
            }
        }
        Ok(())
    }

    /// Undo what a failed transfer left in the catalog.
    pub(crate) async fn abandon(&self, job: &Job<'_>) {
        match job.encoder.kind() {
            EncoderKind::Encoder => {}
            EncoderKind::Decoder => return,
            EncoderKind::Eraser => return self.record_partial_delete(job).await,
        }
        let oid = job.object.oid.as_str();
        let result = async {
            self.retry("drop layout", || self.catalog.delete_layout(oid)).await?;
            self.retry("drop reservation", || self.catalog.delete_object(oid)).await
        }
        .await;
        match result {
            Ok(_) => debug!(%oid, "put rolled back"),
            Err(e) => error!(%oid, error = %e, "could not roll back put; reservation left behind"),
        }
    }

    /// A delete that failed midway has already removed some extents. Save
    /// the layout with those marked orphan so gets fail as corrupt and a
    /// later delete resumes from the remaining ones.
    async fn record_partial_delete(&self, job: &Job<'_>) {
        let layout = job.encoder.layout();
        let erased = layout
            .extents
            .iter()
            .filter(|e| e.state == ExtentState::Orphan)
            .count();
        if erased == 0 {
            return;
        }
        let oid = layout.oid.as_str();
        warn!(%oid, erased, remaining = layout.extents.len() - erased, "delete interrupted, object is no longer readable");
        if let Err(e) = self
            .retry("record erased extents", || self.catalog.put_layout(layout))
            .await
        {
            error!(%oid, error = %e, "could not record erased extents; layout points at removed data");
        }
    }
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("hostname", &self.hostname)
            .finish_non_exhaustive()
    }
}

/// Reject transfers this operation cannot process.
fn check(xfer: &Transfer, op: XferOp) -> StoreResult<()> {
    if xfer.oid.is_empty() {
        return Err(StoreError::InvalidArgument("empty object id".into()));
    }
    if xfer.op != op {
        return Err(StoreError::InvalidArgument(format!(
            "{}: {:?} transfer passed to {op:?}",
            xfer.oid, xfer.op
        )));
    }
    if xfer.is_finished() {
        return Err(StoreError::InvalidArgument(format!(
            "{}: transfer already processed",
            xfer.oid
        )));
    }
    Ok(())
}

/// Record a final status unless the transfer already carries one.
/// Returns the rc to report.
fn settle(xfer: &mut Transfer, status: Result<(), tapegrid_core::ErrorKind>) -> i32 {
    if !xfer.is_finished() {
        xfer.status = Some(status);
    }
    match status {
        Ok(()) => 0,
        Err(kind) => kind.errno(),
    }
}

/// Finalize transfers rejected before their batch ran. Their errors came
/// first, so they take precedence over the batch's own.
fn report_rejected<F>(
    xfers: &mut [Transfer],
    rejected: Vec<(usize, StoreError)>,
    callback: &mut F,
    batch_error: Option<StoreError>,
) -> StoreResult<()>
where
    F: FnMut(&Transfer, i32),
{
    let mut first = None;
    for (index, err) in rejected {
        let xfer = &mut xfers[index];
        warn!(oid = %xfer.oid, error = %err, "transfer rejected");
        let rc = settle(xfer, Err(err.kind()));
        callback(&*xfer, rc);
        first.get_or_insert(err);
    }
    match first.or(batch_error) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
