//! FIFO of pending still-image requests, one completion signal per request

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use tokio::sync::oneshot;

use crate::capture::frame::{Frame, ImageFormat};
use crate::error::{CaptureError, Result};

/// Worker-side half of a pending still capture
pub struct StillRequest {
    seq: u64,
    format: ImageFormat,
    enqueued_at: Instant,
    reply: oneshot::Sender<Result<Frame>>,
}

impl StillRequest {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// Time spent waiting in the queue so far
    pub fn queued_for(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    /// The caller dropped its ticket
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }
}

/// Caller-side half: resolves with the frame captured for this request only
#[derive(Debug)]
pub struct StillTicket {
    seq: u64,
    result: oneshot::Receiver<Result<Frame>>,
}

impl StillTicket {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub async fn wait_timeout(self, timeout: Duration) -> Result<Frame> {
        tokio::time::timeout(timeout, self)
            .await
            .map_err(|_| CaptureError::Timeout(timeout))?
    }
}

impl Future for StillTicket {
    type Output = Result<Frame>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // a request dropped unresolved only happens when the worker died
        Pin::new(&mut self.result)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(CaptureError::CoordinatorStopped)))
    }
}

struct Inbox {
    tx: Option<Sender<StillRequest>>,
    next_seq: u64,
    closed_with: Option<CaptureError>,
}

/// Many callers enqueue, the worker alone dequeues and resolves.
pub struct StillCaptureQueue {
    inbox: Mutex<Inbox>,
    rx: Receiver<StillRequest>,
}

impl Default for StillCaptureQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl StillCaptureQueue {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            inbox: Mutex::new(Inbox {
                tx: Some(tx),
                next_seq: 1,
                closed_with: None,
            }),
            rx,
        }
    }

    /// Append a new request. Fails with the stop cause once closed.
    pub fn enqueue(&self, format: ImageFormat) -> Result<StillTicket> {
        let mut inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = inbox.tx.as_ref() else {
            return Err(inbox
                .closed_with
                .clone()
                .unwrap_or(CaptureError::CoordinatorStopped));
        };

        // sequence is taken under the same lock as the append, so it matches FIFO order
        let seq = inbox.next_seq;
        let (reply, result) = oneshot::channel();
        tx.send(StillRequest {
            seq,
            format,
            enqueued_at: Instant::now(),
            reply,
        })
        .map_err(|_| CaptureError::CoordinatorStopped)?;
        inbox.next_seq += 1;

        Ok(StillTicket { seq, result })
    }

    /// Pop the oldest pending request without blocking
    pub fn dequeue_next(&self) -> Option<StillRequest> {
        self.rx.try_recv().ok()
    }

    /// Deliver `result` to the request's caller. Returns false if the caller is gone.
    pub fn resolve(&self, request: StillRequest, result: Result<Frame>) -> bool {
        request.reply.send(result).is_ok()
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Refuse further requests and hand back everything still queued
    pub fn close(&self, err: CaptureError) -> Vec<StillRequest> {
        {
            let mut inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
            inbox.tx = None;
            inbox.closed_with.get_or_insert(err);
        }
        self.rx.try_iter().collect()
    }

    /// Wakes when a request arrives; used by the worker's select loop
    pub(crate) fn receiver(&self) -> &Receiver<StillRequest> {
        &self.rx
    }
}
