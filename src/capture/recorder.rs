//! Recording thread shared by the device backends
//!
//! A V4L2 node or webcam handle can only be streamed by one reader, so a
//! grabber thread owns the source outright and grabs one frame per command.
//! The recording thread drives it: still captures are interleaved at frame
//! boundaries, so a still request is answered with the first frame whose
//! grab was commanded after the request arrived, re-encoded for the still
//! path. A grab that does not come back within the grab timeout counts as a
//! failed frame, so a device that goes silent still faults the stream.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use flume::{Receiver, RecvTimeoutError, Sender};
use image::RgbImage;
use tracing::{debug, error, info, warn};

use super::codec;
use super::frame::ImageFormat;
use super::VideoSink;
use crate::error::{CaptureError, Result};

/// One frame as it comes off the device
pub enum RawFrame {
    /// Already JPEG encoded (MJPEG devices)
    Jpeg(Bytes),
    Rgb(RgbImage),
}

/// Blocking frame producer owned by the grabber thread
pub trait FrameSource {
    fn grab(&mut self) -> Result<RawFrame>;
}

#[derive(Debug, Clone)]
pub struct RecorderSettings {
    /// Video frames are resized to this when set
    pub video_size: Option<(u32, u32)>,
    pub video_quality: u8,
    /// Stills are resized to this when set
    pub still_size: Option<(u32, u32)>,
    pub still_quality: u8,
    /// Longest a single grab may take before it counts as failed
    pub grab_timeout: Duration,
    /// Sleep between grabs for sources that are not paced by the device
    pub pace_fps: Option<u32>,
    pub max_consecutive_errors: u32,
}

struct StillGrab {
    format: ImageFormat,
    reply: Sender<Result<Bytes>>,
}

/// Command and reply ends of the grabber thread
struct Grabber {
    commands: Sender<()>,
    frames: Receiver<Result<RawFrame>>,
}

pub struct Recorder {
    stop: Arc<AtomicBool>,
    stills: Sender<StillGrab>,
    grab_timeout: Duration,
    recorder: Option<JoinHandle<()>>,
    grabber: Option<JoinHandle<()>>,
    // disconnects when the grabber thread has dropped its source
    grabber_exited: Receiver<()>,
}

impl Recorder {
    /// Start the grabber and recording threads. `open` runs on the grabber
    /// thread, so the source does not need to be `Send`; its failure is
    /// returned here.
    pub fn spawn<S, F>(name: &str, open: F, sink: VideoSink, settings: RecorderSettings) -> Result<Self>
    where
        S: FrameSource + 'static,
        F: FnOnce() -> Result<S> + Send + 'static,
    {
        let (ready_tx, ready_rx) = flume::bounded(1);
        let (commands_tx, commands_rx) = flume::bounded::<()>(1);
        let (frames_tx, frames_rx) = flume::bounded(1);
        let (exit_tx, grabber_exited) = flume::bounded::<()>(0);

        let grabber = thread::Builder::new()
            .name(format!("{name}-grabber"))
            .spawn(move || {
                let _exit = exit_tx;
                let mut source = match open() {
                    Ok(source) => {
                        let _ = ready_tx.send(Ok(()));
                        source
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                for () in commands_rx.iter() {
                    if frames_tx.send(source.grab()).is_err() {
                        break;
                    }
                }
                debug!("Grabber exited");
            })?;

        let opened = match ready_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(CaptureError::DeviceUnavailable(format!(
                "{name} grabber exited while opening the device"
            ))),
        };
        if let Err(e) = opened {
            if grabber.join().is_err() {
                warn!("Grabber thread panicked");
            }
            return Err(e);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (stills_tx, stills_rx) = flume::unbounded();
        let grab_timeout = settings.grab_timeout;
        let link = Grabber {
            commands: commands_tx,
            frames: frames_rx,
        };

        let thread_stop = stop.clone();
        let recorder = thread::Builder::new()
            .name(format!("{name}-recorder"))
            .spawn(move || record(link, sink, stills_rx, thread_stop, settings))?;

        info!("{} recording started", name);
        Ok(Self {
            stop,
            stills: stills_tx,
            grab_timeout,
            recorder: Some(recorder),
            grabber: Some(grabber),
            grabber_exited,
        })
    }

    /// Wait for the next fresh frame and write it to `out` as `format`
    pub fn grab_still(&self, out: &mut dyn Write, format: ImageFormat) -> Result<()> {
        let (reply, response) = flume::bounded(1);
        self.stills
            .send(StillGrab { format, reply })
            .map_err(|_| CaptureError::CaptureFailed("recording has stopped".into()))?;

        // a grab already in flight has to finish before the fresh one starts
        let wait = self.grab_timeout * 2;
        match response.recv_timeout(wait) {
            Ok(Ok(bytes)) => {
                out.write_all(&bytes)?;
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::CaptureFailed(format!(
                "no frame grabbed within {:?}",
                wait
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::CaptureFailed(
                "recording stopped before a frame was grabbed".into(),
            )),
        }
    }

    /// Stop recording. Returns within about two grab timeouts even when the
    /// source is stuck inside a grab; such a grabber is left detached.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.recorder.take() {
            if handle.join().is_err() {
                warn!("Recorder thread panicked");
            }
        }

        let Some(handle) = self.grabber.take() else {
            return;
        };
        match self.grabber_exited.recv_timeout(self.grab_timeout) {
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Grabber still blocked after {:?}, leaving it detached",
                    self.grab_timeout
                );
            }
            _ => {
                if handle.join().is_err() {
                    warn!("Grabber thread panicked");
                }
            }
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn record(
    grabber: Grabber,
    sink: VideoSink,
    stills: Receiver<StillGrab>,
    stop: Arc<AtomicBool>,
    settings: RecorderSettings,
) {
    let frame_interval = settings
        .pace_fps
        .filter(|fps| *fps > 0)
        .map(|fps| Duration::from_secs_f64(1.0 / fps as f64));
    let max_errors = settings.max_consecutive_errors.max(1);
    let mut failures = 0u32;
    let mut waiting: Vec<StillGrab> = Vec::new();
    let mut in_flight = false;
    let mut started = Instant::now();

    while !stop.load(Ordering::Acquire) {
        if !in_flight {
            // only requests queued before the grab is commanded are served by it
            waiting.extend(stills.try_iter());
            if grabber.commands.send(()).is_err() {
                sink.fault(CaptureError::CaptureFailed("frame grabber exited".into()));
                break;
            }
            in_flight = true;
            started = Instant::now();
        }

        let grabbed = match grabber.frames.recv_timeout(settings.grab_timeout) {
            Ok(grabbed) => {
                in_flight = false;
                grabbed
            }
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::CaptureFailed(format!(
                "no frame from the device within {:?}",
                settings.grab_timeout
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                sink.fault(CaptureError::CaptureFailed("frame grabber exited".into()));
                break;
            }
        };

        let raw = match grabbed {
            Ok(raw) => {
                failures = 0;
                raw
            }
            Err(err) => {
                failures += 1;
                if failures >= max_errors {
                    error!("Giving up after {} consecutive grab failures: {}", failures, err);
                    sink.fault(err);
                    break;
                }
                sink.skip(&err);
                continue;
            }
        };

        for grab in waiting.drain(..) {
            let result = encode_still(&raw, grab.format, &settings);
            if grab.reply.send(result).is_err() {
                debug!("Still grab abandoned before delivery");
            }
        }

        match encode_video(&raw, &settings) {
            Ok(bytes) => sink.write(bytes),
            Err(err) => sink.skip(&err),
        }

        if let Some(interval) = frame_interval {
            let elapsed = started.elapsed();
            if elapsed < interval {
                thread::sleep(interval - elapsed);
            }
        }
    }

    debug!("Recording loop exited");
}

fn encode_video(raw: &RawFrame, settings: &RecorderSettings) -> Result<Bytes> {
    match raw {
        RawFrame::Jpeg(bytes) if settings.video_size.is_none() => Ok(bytes.clone()),
        _ => reencode(raw, ImageFormat::Jpeg, settings.video_size, settings.video_quality),
    }
}

fn encode_still(raw: &RawFrame, format: ImageFormat, settings: &RecorderSettings) -> Result<Bytes> {
    match raw {
        RawFrame::Jpeg(bytes) if format == ImageFormat::Jpeg && settings.still_size.is_none() => {
            Ok(bytes.clone())
        }
        _ => reencode(raw, format, settings.still_size, settings.still_quality),
    }
}

fn reencode(raw: &RawFrame, format: ImageFormat, size: Option<(u32, u32)>, quality: u8) -> Result<Bytes> {
    let rgb = match raw {
        RawFrame::Jpeg(bytes) => codec::decode_jpeg(bytes)?,
        RawFrame::Rgb(img) => img.clone(),
    };
    let rgb = codec::fit(rgb, size);
    let mut out = Vec::new();
    codec::encode_rgb(&rgb, format, quality, &mut out)?;
    Ok(Bytes::from(out))
}
