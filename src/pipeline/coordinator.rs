//! One worker thread that owns the capture device and serves both
//! the continuous video stream and on-demand still requests.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, Selector, Sender};
use once_cell::sync::OnceCell;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, instrument, warn};

use super::broadcast::FrameBroadcaster;
use super::stats::{CoordinatorStats, StatsSnapshot};
use super::still_queue::{StillCaptureQueue, StillRequest, StillTicket};
use crate::capture::frame::{Frame, ImageFormat, VersionedFrame};
use crate::capture::{Acquirer, CaptureBackend, VideoSink};
use crate::error::{CaptureError, Result};
use crate::{Config, CoordinatorConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Initializing,
    Streaming,
    /// Terminal
    Stopped,
}

struct Shared {
    broadcaster: Arc<FrameBroadcaster>,
    queue: StillCaptureQueue,
    state: watch::Sender<CoordinatorState>,
    stop_cause: OnceCell<CaptureError>,
    stats: Arc<CoordinatorStats>,
}

impl Shared {
    fn stop_error(&self) -> CaptureError {
        self.stop_cause
            .get()
            .cloned()
            .unwrap_or(CaptureError::CoordinatorStopped)
    }

    /// Move to `Stopped`, failing every waiter with `err`. Worker thread only.
    fn enter_stopped(&self, err: CaptureError) {
        if *self.state.borrow() == CoordinatorState::Stopped {
            return;
        }
        let _ = self.stop_cause.set(err.clone());
        self.broadcaster.close(err.clone());
        for request in self.queue.close(err.clone()) {
            debug!(seq = request.seq(), "Failing queued still request");
            self.queue.resolve(request, Err(err.clone()));
        }
        self.state.send_replace(CoordinatorState::Stopped);
        info!("Capture coordinator stopped: {}", err);
    }
}

/// Shared handle to the capture device.
///
/// Video readers get the latest frame newer than the one they last saw;
/// still callers each get the frame captured for their own request, in
/// submission order. Dropping the coordinator stops the worker and
/// releases the device.
pub struct CaptureCoordinator {
    shared: Arc<Shared>,
    config: CoordinatorConfig,
    default_format: ImageFormat,
    shutdown: Sender<()>,
    exited: Receiver<()>,
    worker: Option<JoinHandle<()>>,
}

impl CaptureCoordinator {
    /// Spawn the worker, which acquires the device and starts streaming.
    /// Acquisition failures surface through [`ready`](Self::ready) and every call after.
    pub fn start(config: &Config, acquire: Acquirer) -> Result<Self> {
        let (state, _) = watch::channel(CoordinatorState::Initializing);
        let shared = Arc::new(Shared {
            broadcaster: Arc::new(FrameBroadcaster::new()),
            queue: StillCaptureQueue::new(),
            state,
            stop_cause: OnceCell::new(),
            stats: Arc::new(CoordinatorStats::default()),
        });

        let (shutdown_tx, shutdown_rx) = flume::bounded(1);
        let (exit_tx, exit_rx) = flume::bounded::<()>(0);

        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("camshare-worker".into())
            .spawn(move || run_worker(worker_shared, acquire, shutdown_rx, exit_tx))
            .map_err(|e| {
                CaptureError::DeviceUnavailable(format!("failed to spawn capture worker: {e}"))
            })?;

        Ok(Self {
            shared,
            config: config.coordinator.clone(),
            default_format: config.still.format,
            shutdown: shutdown_tx,
            exited: exit_rx,
            worker: Some(worker),
        })
    }

    pub fn state(&self) -> CoordinatorState {
        *self.shared.state.borrow()
    }

    /// Resolve once streaming has started, or fail with the stop cause
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.shared.state.subscribe();
        let state = *rx
            .wait_for(|state| *state != CoordinatorState::Initializing)
            .await
            .map_err(|_| CaptureError::CoordinatorStopped)?;
        match state {
            CoordinatorState::Stopped => Err(self.shared.stop_error()),
            _ => Ok(()),
        }
    }

    pub async fn wait_stopped(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx
            .wait_for(|state| *state == CoordinatorState::Stopped)
            .await;
    }

    /// Next video frame newer than `after`, bounded by the configured video timeout
    pub async fn get_video_frame(&self, after: Option<u64>) -> Result<VersionedFrame> {
        match self.config.video_timeout() {
            Some(timeout) => self.get_video_frame_timeout(after, timeout).await,
            None => self.shared.broadcaster.await_next(after).await,
        }
    }

    pub async fn get_video_frame_timeout(
        &self,
        after: Option<u64>,
        timeout: Duration,
    ) -> Result<VersionedFrame> {
        self.shared
            .broadcaster
            .await_next_timeout(after, timeout)
            .await
    }

    /// Cursor that remembers the last version it returned
    pub fn video_reader(&self) -> VideoReader {
        VideoReader {
            broadcaster: self.shared.broadcaster.clone(),
            last_seen: None,
            timeout: self.config.video_timeout(),
        }
    }

    pub fn latest_frame(&self) -> Option<VersionedFrame> {
        self.shared.broadcaster.latest()
    }

    /// Queue a still request without waiting for it
    pub fn submit_still(&self, format: ImageFormat) -> Result<StillTicket> {
        let ticket = self.shared.queue.enqueue(format)?;
        debug!(seq = ticket.seq(), ?format, "Still requested");
        Ok(ticket)
    }

    /// Capture one still in the configured format
    pub async fn get_image_frame(&self) -> Result<Frame> {
        self.get_image_frame_as(self.default_format).await
    }

    pub async fn get_image_frame_as(&self, format: ImageFormat) -> Result<Frame> {
        let ticket = self.submit_still(format)?;
        match self.config.still_timeout() {
            Some(timeout) => ticket.wait_timeout(timeout).await,
            None => ticket.await,
        }
    }

    /// Ask the worker to stop; see [`wait_stopped`](Self::wait_stopped)
    pub fn shutdown(&self) {
        let _ = self.shutdown.try_send(());
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Disconnects once the worker has exited and the device is released
    pub(crate) fn exit_signal(&self) -> Receiver<()> {
        self.exited.clone()
    }
}

impl Drop for CaptureCoordinator {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Capture worker panicked");
            }
        }
    }
}

/// Per-caller position in the video stream
pub struct VideoReader {
    broadcaster: Arc<FrameBroadcaster>,
    last_seen: Option<u64>,
    timeout: Option<Duration>,
}

impl VideoReader {
    pub fn last_seen(&self) -> Option<u64> {
        self.last_seen
    }

    /// A frame this reader has not seen yet
    pub async fn next_frame(&mut self) -> Result<Frame> {
        Ok(self.next_versioned().await?.frame)
    }

    pub async fn next_versioned(&mut self) -> Result<VersionedFrame> {
        let next = match self.timeout {
            Some(timeout) => {
                self.broadcaster
                    .await_next_timeout(self.last_seen, timeout)
                    .await?
            }
            None => self.broadcaster.await_next(self.last_seen).await?,
        };
        self.last_seen = Some(next.version);
        Ok(next)
    }
}

/// Releases the backend exactly once, whichever way the worker exits
struct DeviceGuard {
    backend: Box<dyn CaptureBackend>,
}

impl Deref for DeviceGuard {
    type Target = dyn CaptureBackend;

    fn deref(&self) -> &Self::Target {
        self.backend.as_ref()
    }
}

impl DerefMut for DeviceGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.backend.as_mut()
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        info!("Releasing {}", self.backend.name());
        self.backend.release();
    }
}

/// Guarantees `Stopped` is reached even if the worker unwinds
struct StopGuard(Arc<Shared>);

impl Drop for StopGuard {
    fn drop(&mut self) {
        self.0.enter_stopped(CaptureError::CoordinatorStopped);
    }
}

enum Wake {
    Still(StillRequest),
    Fault(CaptureError),
    Shutdown,
}

fn run_worker(
    shared: Arc<Shared>,
    acquire: Acquirer,
    shutdown: Receiver<()>,
    exited: Sender<()>,
) {
    // dropped last: the device is free by the time anyone sees the disconnect
    let _exited = exited;
    let _stopped = StopGuard(shared.clone());
    let span = info_span!("capture_worker");
    let _enter = span.enter();

    let backend = match acquire() {
        Ok(backend) => backend,
        Err(e) => {
            error!("Failed to acquire capture device: {}", e);
            shared.enter_stopped(unavailable(e));
            return;
        }
    };
    let mut device = DeviceGuard { backend };
    info!("Acquired {}", device.name());

    let (faults_tx, faults_rx) = flume::unbounded();
    let sink = VideoSink::new(shared.broadcaster.clone(), faults_tx, shared.stats.clone());
    if let Err(e) = device.start_continuous(sink) {
        error!("Failed to start continuous recording: {}", e);
        drop(device);
        shared.enter_stopped(unavailable(e));
        return;
    }

    shared.state.send_replace(CoordinatorState::Streaming);
    info!("Streaming from {}", device.name());

    loop {
        let wake = Selector::new()
            .recv(shared.queue.receiver(), |r| {
                r.map(Wake::Still).unwrap_or(Wake::Shutdown)
            })
            .recv(&faults_rx, |r| {
                Wake::Fault(r.unwrap_or_else(|_| {
                    CaptureError::CaptureFailed("video stream ended".into())
                }))
            })
            .recv(&shutdown, |_| Wake::Shutdown)
            .wait();

        match wake {
            Wake::Still(request) => service_still(&shared, &mut device, request),
            Wake::Fault(e) => {
                error!("Continuous capture failed: {}", e);
                break;
            }
            Wake::Shutdown => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    drop(device);
    shared.enter_stopped(CaptureError::CoordinatorStopped);
}

#[instrument(skip_all, fields(seq = request.seq(), format = ?request.format()))]
fn service_still(shared: &Shared, device: &mut DeviceGuard, request: StillRequest) {
    let seq = request.seq();
    if request.is_abandoned() {
        warn!(seq, "Still request abandoned before capture");
        shared.stats.record_abandoned();
        return;
    }

    let started = Instant::now();
    let format = request.format();
    let mut out = Vec::new();
    let result = device
        .capture_one(&mut out, format)
        .and_then(|()| {
            if out.is_empty() {
                Err(CaptureError::CaptureFailed("device produced an empty still".into()))
            } else {
                Ok(Frame::new(out, format))
            }
        })
        .map_err(|e| match e {
            CaptureError::CaptureFailed(_) => e,
            other => CaptureError::CaptureFailed(other.to_string()),
        });

    match &result {
        Ok(frame) => {
            debug!(
                seq,
                bytes = frame.len(),
                queued = ?request.queued_for(),
                elapsed = ?started.elapsed(),
                "Still captured"
            );
            shared.stats.record_still();
        }
        Err(e) => {
            warn!(seq, "Still capture failed: {}", e);
            shared.stats.record_still_failed();
        }
    }

    if !shared.queue.resolve(request, result) {
        warn!(seq, "Requester gone before the still was delivered");
        shared.stats.record_abandoned();
    }
}

fn unavailable(err: CaptureError) -> CaptureError {
    match err {
        CaptureError::DeviceUnavailable(_) => err,
        other => CaptureError::DeviceUnavailable(other.to_string()),
    }
}
