//! Client side of the scheduler: submission and response collection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tapegrid_core::{CorrelationId, Request, Response};
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::debug;

use crate::error::{LrsError, LrsResult};

/// Responses addressed to one client, in the order the scheduler emitted
/// them.
#[derive(Debug, Default)]
pub(crate) struct Mailbox {
    queue: Mutex<VecDeque<Response>>,
    notify: Notify,
}

impl Mailbox {
    pub(crate) fn push(&self, response: Response) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(response);
        self.notify.notify_one();
    }

    fn drain(&self) -> Vec<Response> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    /// Put back responses a caller drained but did not consume.
    fn requeue_front(&self, responses: Vec<Response>) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        for response in responses.into_iter().rev() {
            queue.push_front(response);
        }
    }
}

/// A request on its way to the dispatcher.
pub(crate) struct Envelope {
    pub id: CorrelationId,
    pub request: Request,
    pub mailbox: Arc<Mailbox>,
}

pub(crate) enum Control {
    Cancel {
        id: CorrelationId,
        reply: oneshot::Sender<bool>,
    },
}

/// Handle used by transfer state machines to talk to the scheduler.
///
/// Each client has its own mailbox; responses for requests it submitted
/// are only ever delivered to it. Clones share the mailbox.
#[derive(Clone)]
pub struct LrsClient {
    ids: Arc<AtomicU64>,
    submissions: mpsc::Sender<Envelope>,
    control: mpsc::UnboundedSender<Control>,
    mailbox: Arc<Mailbox>,
}

impl LrsClient {
    pub(crate) fn new(
        ids: Arc<AtomicU64>,
        submissions: mpsc::Sender<Envelope>,
        control: mpsc::UnboundedSender<Control>,
    ) -> Self {
        Self {
            ids,
            submissions,
            control,
            mailbox: Arc::new(Mailbox::default()),
        }
    }

    /// Another client of the same scheduler with a mailbox of its own.
    pub fn split(&self) -> Self {
        Self::new(
            Arc::clone(&self.ids),
            self.submissions.clone(),
            self.control.clone(),
        )
    }

    /// Queue a request. Never blocks; fails with `QueueFull` when the
    /// dispatcher is behind by more than the configured queue depth.
    pub fn submit(&self, request: Request) -> LrsResult<CorrelationId> {
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        let kind = request.kind_str();
        let envelope = Envelope {
            id,
            request,
            mailbox: Arc::clone(&self.mailbox),
        };
        self.submissions.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => LrsError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => LrsError::Stopped,
        })?;
        debug!(request = id, kind, "request submitted");
        Ok(id)
    }

    /// Responses available right now, without waiting.
    pub fn poll_responses(&self) -> Vec<Response> {
        self.mailbox.drain()
    }

    /// Wait until at least one response is available and return all of
    /// them.
    pub async fn wait_responses(&self) -> Vec<Response> {
        loop {
            let notified = self.mailbox.notify.notified();
            let responses = self.mailbox.drain();
            if !responses.is_empty() {
                return responses;
            }
            notified.await;
        }
    }

    /// Wait for the response to `id`. Other responses stay queued.
    pub async fn wait_for(&self, id: CorrelationId) -> Response {
        loop {
            let mut responses = self.wait_responses().await;
            if let Some(pos) = responses.iter().position(|r| r.id == id) {
                let response = responses.remove(pos);
                self.mailbox.requeue_front(responses);
                return response;
            }
            self.mailbox.requeue_front(responses);
            // Others are queued but not ours; wait for the next push.
            self.mailbox.notify.notified().await;
        }
    }

    /// Cancel a request that has not been granted yet. Returns `false` if
    /// it was unknown, already answered or already granted. A cancelled
    /// request is answered with `Cancelled`.
    pub async fn cancel(&self, id: CorrelationId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.control.send(Control::Cancel { id, reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

impl std::fmt::Debug for LrsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LrsClient").finish_non_exhaustive()
    }
}
