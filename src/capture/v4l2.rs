//! V4L2 hardware capture with memory-mapped streaming

use std::io::Write;
use std::time::Duration;

use bytes::Bytes;
use tracing::{info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::codec;
use super::frame::{ImageFormat, PixelFormat};
use super::recorder::{FrameSource, RawFrame, Recorder, RecorderSettings};
use super::{CaptureBackend, VideoSink};
use crate::error::{CaptureError, Result};
use crate::utils::FoundDevice;
use crate::Config;

fn fourcc(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
        PixelFormat::Yuyv => FourCC::new(b"YUYV"),
    }
}

fn unavailable(path: &str, err: std::io::Error) -> CaptureError {
    CaptureError::DeviceUnavailable(format!("{path}: {err}"))
}

/// Hardware backend: one V4L2 capture node, streamed by the recorder thread
pub struct V4l2Backend {
    path: String,
    device: Option<Device>,
    format: PixelFormat,
    width: u32,
    height: u32,
    stride: u32,
    buffer_count: u32,
    settings: RecorderSettings,
    recorder: Option<Recorder>,
}

impl V4l2Backend {
    /// Open the node and negotiate the video format
    #[instrument(skip(config))]
    pub fn open(config: &Config, found: &FoundDevice) -> Result<Self> {
        let path = found.path.as_str();
        let device = Device::with_path(path).map_err(|e| unavailable(path, e))?;

        let caps = device.query_caps().map_err(|e| unavailable(path, e))?;
        info!("Device: {} ({})", caps.card, caps.driver);
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::DeviceUnavailable(format!(
                "{path} doesn't support video capture"
            )));
        }

        let mut fmt = device.format().map_err(|e| unavailable(path, e))?;
        fmt.width = config.video.width;
        fmt.height = config.video.height;
        fmt.fourcc = fourcc(found.format);
        let fmt = device.set_format(&fmt).map_err(|e| unavailable(path, e))?;
        if fmt.fourcc != fourcc(found.format) {
            return Err(CaptureError::DeviceUnavailable(format!(
                "{path} refused {:?}, offered {}",
                found.format, fmt.fourcc
            )));
        }

        if let Err(e) = device.set_params(&Parameters::with_fps(config.video.fps)) {
            warn!("Could not set {} fps on {}: {}", config.video.fps, path, e);
        }

        // frames only need resizing when the driver picked another size
        let requested = (config.video.width, config.video.height);
        let video_size = if (fmt.width, fmt.height) != requested {
            warn!(
                "{} negotiated {}x{} instead of {}x{}",
                path, fmt.width, fmt.height, requested.0, requested.1
            );
            Some(requested)
        } else {
            None
        };

        Ok(Self {
            path: path.to_string(),
            device: Some(device),
            format: found.format,
            width: fmt.width,
            height: fmt.height,
            stride: fmt.stride,
            buffer_count: config.capture.buffer_count,
            settings: RecorderSettings {
                video_size,
                video_quality: config.video.jpeg_quality,
                still_size: config.still.size(),
                still_quality: config.still.jpeg_quality,
                grab_timeout: config.still.grab_timeout(),
                pace_fps: None,
                max_consecutive_errors: config.capture.max_consecutive_errors,
            },
            recorder: None,
        })
    }
}

impl CaptureBackend for V4l2Backend {
    fn name(&self) -> &str {
        &self.path
    }

    fn start_continuous(&mut self, sink: VideoSink) -> Result<()> {
        let device = self
            .device
            .take()
            .ok_or_else(|| CaptureError::DeviceUnavailable(format!("{} already released", self.path)))?;

        let path = self.path.clone();
        let layout = FrameLayout {
            format: self.format,
            width: self.width,
            height: self.height,
            stride: self.stride,
        };
        let (buffer_count, grab_timeout) = (self.buffer_count, self.settings.grab_timeout);
        let recorder = Recorder::spawn(
            "v4l2",
            move || V4l2Source::start(device, &path, layout, buffer_count, grab_timeout),
            sink,
            self.settings.clone(),
        )?;
        self.recorder = Some(recorder);
        Ok(())
    }

    #[instrument(skip(self, sink))]
    fn capture_one(&mut self, sink: &mut dyn Write, format: ImageFormat) -> Result<()> {
        self.recorder
            .as_ref()
            .ok_or_else(|| CaptureError::CaptureFailed("recording not started".into()))?
            .grab_still(sink, format)
    }

    fn release(&mut self) {
        if let Some(mut recorder) = self.recorder.take() {
            recorder.stop();
        }
        self.device = None;
    }
}

impl Drop for V4l2Backend {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameLayout {
    format: PixelFormat,
    width: u32,
    height: u32,
    /// Bytes per row as negotiated with the driver
    stride: u32,
}

struct V4l2Source {
    // the stream shares the device handle; keep the device alive beside it
    _device: Device,
    stream: MmapStream<'static>,
    layout: FrameLayout,
}

impl V4l2Source {
    fn start(
        device: Device,
        path: &str,
        layout: FrameLayout,
        buffer_count: u32,
        grab_timeout: Duration,
    ) -> Result<Self> {
        let mut stream = MmapStream::with_buffers(&device, Type::VideoCapture, buffer_count)
            .map_err(|e| unavailable(path, e))?;
        // a silent device surfaces as a TimedOut error instead of a blocked dequeue
        stream.set_timeout(grab_timeout);
        info!("Capture stream started with {} buffers", buffer_count);

        Ok(Self {
            _device: device,
            stream,
            layout,
        })
    }
}

impl FrameSource for V4l2Source {
    fn grab(&mut self) -> Result<RawFrame> {
        let (buf, meta) = self.stream.next()?;
        let used = (meta.bytesused as usize).min(buf.len());
        let data = &buf[..used];

        let layout = self.layout;
        match layout.format {
            PixelFormat::Mjpeg => Ok(RawFrame::Jpeg(Bytes::copy_from_slice(data))),
            PixelFormat::Yuyv => Ok(RawFrame::Rgb(codec::yuyv_to_rgb(
                data,
                layout.width,
                layout.height,
                layout.stride,
            )?)),
        }
    }
}
