//! Concurrent driver for a batch of transfer state machines.
//!
//! Every job's encoder keeps at most one request outstanding. Responses
//! are routed back by correlation id; a job leaves the batch exactly once,
//! either committed or abandoned, and its callback fires at that moment.

use std::collections::{HashMap, HashSet};

use tapegrid_core::{CorrelationId, Request, Response};
use tapegrid_layout::{Encoder, EncoderKind, LayoutResult, StepOutput, Transfer};
use tapegrid_lrs::{Backoff, LrsClient, LrsError, LrsResult};
use tapegrid_state::ObjectInfo;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::ObjectStore;

/// One transfer in flight and the object record it commits into.
pub(crate) struct Job<'x> {
    pub encoder: Encoder<'x>,
    pub object: ObjectInfo,
}

pub(crate) struct Batch<'b, 'x, F> {
    store: &'b ObjectStore,
    client: LrsClient,
    /// `None` once the job has been finalized.
    jobs: Vec<Option<Job<'x>>>,
    /// Outstanding request id to the job waiting on it.
    waiting: HashMap<CorrelationId, usize>,
    /// Releases submitted for failed jobs, still unanswered.
    releases: HashSet<CorrelationId>,
    callback: &'b mut F,
    first_error: Option<StoreError>,
}

impl<'b, 'x, F> Batch<'b, 'x, F>
where
    F: FnMut(&Transfer, i32),
{
    pub(crate) fn new(store: &'b ObjectStore, client: LrsClient, callback: &'b mut F) -> Self {
        Self {
            store,
            client,
            jobs: Vec::new(),
            waiting: HashMap::new(),
            releases: HashSet::new(),
            callback,
            first_error: None,
        }
    }

    pub(crate) fn push(&mut self, job: Job<'x>) {
        self.jobs.push(Some(job));
    }

    /// Drive every job to completion. Returns the first failure.
    pub(crate) async fn run(mut self) -> Option<StoreError> {
        debug!(jobs = self.jobs.len(), "batch started");
        for index in 0..self.jobs.len() {
            let Some(job) = self.jobs[index].as_mut() else {
                continue;
            };
            let result = step(&mut job.encoder, None);
            self.advance(index, result).await;
        }

        while !self.waiting.is_empty() || !self.releases.is_empty() {
            for response in self.client.wait_responses().await {
                self.dispatch(response).await;
            }
        }
        self.first_error
    }

    async fn dispatch(&mut self, response: Response) {
        if self.releases.remove(&response.id) {
            if let Some(kind) = response.error_kind() {
                warn!(request = response.id, %kind, "release of a failed transfer was refused");
            }
            return;
        }
        let Some(index) = self.waiting.remove(&response.id) else {
            warn!(request = response.id, "response for no waiting transfer");
            return;
        };
        let Some(job) = self.jobs[index].as_mut() else {
            return;
        };
        let result = step(&mut job.encoder, Some(response));
        self.advance(index, result).await;
    }

    async fn advance(&mut self, index: usize, result: LayoutResult<StepOutput>) {
        let output = match result {
            Ok(output) => output,
            Err(e) => return self.fail(index, e.into()).await,
        };
        if output.done {
            return self.complete(index).await;
        }
        for request in output.requests {
            match self.submit(request).await {
                Ok(id) => {
                    self.waiting.insert(id, index);
                }
                Err(e) => return self.fail(index, e.into()).await,
            }
        }
    }

    async fn complete(&mut self, index: usize) {
        let Some(mut job) = self.jobs[index].take() else {
            return;
        };
        let store = self.store;
        match store.commit(&mut job).await {
            Ok(()) => self.finish(job, Ok(())),
            Err(e) => {
                self.jobs[index] = Some(job);
                self.fail(index, e).await;
            }
        }
    }

    async fn fail(&mut self, index: usize, err: StoreError) {
        let Some(mut job) = self.jobs[index].take() else {
            return;
        };
        self.waiting.retain(|_, waiting| *waiting != index);

        let written = job.encoder.layout().extents.len();
        if job.encoder.kind() == EncoderKind::Encoder && written > 0 {
            warn!(oid = %job.object.oid, extents = written, "written extents left orphaned on media");
        }
        if let Some(release) = job.encoder.destroy() {
            match self.submit(release).await {
                Ok(id) => {
                    self.releases.insert(id);
                }
                Err(e) => {
                    warn!(oid = %job.object.oid, error = %e, "could not release medium of failed transfer");
                }
            }
        }
        let store = self.store;
        store.abandon(&job).await;
        self.finish(job, Err(err));
    }

    fn finish(&mut self, mut job: Job<'x>, result: Result<(), StoreError>) {
        let status = result.as_ref().map(|_| ()).map_err(StoreError::kind);
        let rc = match status {
            Ok(()) => 0,
            Err(kind) => kind.errno(),
        };
        job.encoder.transfer_mut().status = Some(status);
        (self.callback)(job.encoder.transfer(), rc);

        match result {
            Ok(()) => debug!(oid = %job.object.oid, kind = ?job.encoder.kind(), "transfer succeeded"),
            Err(e) => {
                warn!(oid = %job.object.oid, kind = ?job.encoder.kind(), error = %e, rc, "transfer failed");
                if self.first_error.is_none() {
                    self.first_error = Some(e);
                }
            }
        }
    }

    /// Submit, backing off while the scheduler queue is full.
    async fn submit(&self, request: Request) -> LrsResult<CorrelationId> {
        let config = &self.store.config.lrs;
        let deadline = Instant::now() + config.busy_timeout();
        let mut backoff = Backoff::new(config.busy_backoff_min(), config.busy_backoff_max());
        loop {
            match self.client.submit(request.clone()) {
                Err(LrsError::QueueFull) if Instant::now() < deadline => {
                    let delay = backoff.next_delay();
                    debug!(kind = request.kind_str(), ?delay, "scheduler queue full, backing off");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

/// Advance an encoder. A step reads or writes whole extents, so on a
/// multi-threaded runtime the worker thread hands its other tasks off
/// first. The encoder borrows the caller's transfer, which rules out
/// `spawn_blocking`.
fn step(encoder: &mut Encoder<'_>, response: Option<Response>) -> LayoutResult<StepOutput> {
    let multi_thread = Handle::try_current()
        .is_ok_and(|handle| handle.runtime_flavor() == RuntimeFlavor::MultiThread);
    if multi_thread {
        tokio::task::block_in_place(|| encoder.step(response))
    } else {
        encoder.step(response)
    }
}
