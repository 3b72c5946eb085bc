pub mod codec;
pub mod frame;
pub mod recorder;
pub mod v4l2;
#[cfg(feature = "webcam")]
pub mod webcam;

#[cfg(test)]
pub(crate) mod mock;

use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

pub use frame::{Frame, ImageFormat, PixelFormat, VersionedFrame};
pub use v4l2::V4l2Backend;
#[cfg(feature = "webcam")]
pub use webcam::WebcamBackend;

use crate::error::{CaptureError, Result};
use crate::pipeline::{CoordinatorStats, FrameBroadcaster};

/// What the coordinator needs from a capture device.
///
/// Implementations are driven exclusively by the coordinator's worker thread.
pub trait CaptureBackend {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Begin pushing encoded video frames into `sink` until [`release`](Self::release)
    fn start_continuous(&mut self, sink: VideoSink) -> Result<()>;

    /// Capture one fresh still, writing its encoded bytes to `sink`
    fn capture_one(&mut self, sink: &mut dyn Write, format: ImageFormat) -> Result<()>;

    /// Free every device resource. Must be idempotent.
    fn release(&mut self);
}

/// Opens a backend; called once per coordinator on its worker thread
pub type Acquirer = Arc<dyn Fn() -> Result<Box<dyn CaptureBackend>> + Send + Sync>;

/// Destination for continuous recording
#[derive(Clone)]
pub struct VideoSink {
    broadcaster: Arc<FrameBroadcaster>,
    faults: flume::Sender<CaptureError>,
    stats: Arc<CoordinatorStats>,
}

impl VideoSink {
    pub(crate) fn new(
        broadcaster: Arc<FrameBroadcaster>,
        faults: flume::Sender<CaptureError>,
        stats: Arc<CoordinatorStats>,
    ) -> Self {
        Self {
            broadcaster,
            faults,
            stats,
        }
    }

    /// Publish one encoded JPEG video frame
    pub fn write(&self, data: Bytes) {
        if self.broadcaster.publish(Frame::new(data, ImageFormat::Jpeg)).is_some() {
            self.stats.record_published();
        }
    }

    /// A single frame could not be produced; the stream carries on
    pub fn skip(&self, err: &CaptureError) {
        warn!("Skipping video frame: {}", err);
        self.stats.record_skipped();
    }

    /// The stream is dead; the coordinator will stop
    pub fn fault(&self, err: CaptureError) {
        // worker already gone means the coordinator is stopping anyway
        let _ = self.faults.send(err);
    }
}
