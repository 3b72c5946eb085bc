use std::io::Write;

use image::RgbImage;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    ApiBackend, CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType,
    Resolution,
};
use nokhwa::Camera;
use tracing::{info, instrument};

use super::frame::ImageFormat;
use super::recorder::{FrameSource, RawFrame, Recorder, RecorderSettings};
use super::{CaptureBackend, VideoSink};
use crate::error::{CaptureError, Result};
use crate::Config;

/// Still size when none is configured
const DEFAULT_STILL_SIZE: (u32, u32) = (1024, 768);

/// Software backend for ordinary webcams, for when there is no dedicated camera hardware
pub struct WebcamBackend {
    index: u32,
    width: u32,
    height: u32,
    fps: u32,
    settings: RecorderSettings,
    recorder: Option<Recorder>,
}

impl WebcamBackend {
    /// Check that the camera exists; the stream itself is opened on the recorder thread
    #[instrument(skip(config))]
    pub fn open(config: &Config) -> Result<Self> {
        let index = config.capture.webcam_index;
        let cameras = nokhwa::query(ApiBackend::Auto)
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;
        if !cameras
            .iter()
            .any(|info| info.index() == &CameraIndex::Index(index))
        {
            return Err(CaptureError::DeviceUnavailable(format!(
                "no webcam at index {index} ({} found)",
                cameras.len()
            )));
        }

        let video_size = (config.video.width, config.video.height);
        Ok(Self {
            index,
            width: video_size.0,
            height: video_size.1,
            fps: config.video.fps,
            settings: RecorderSettings {
                video_size: Some(video_size),
                video_quality: config.video.jpeg_quality,
                still_size: Some(config.still.size().unwrap_or(DEFAULT_STILL_SIZE)),
                still_quality: config.still.jpeg_quality,
                grab_timeout: config.still.grab_timeout(),
                pace_fps: Some(config.video.fps),
                max_consecutive_errors: config.capture.max_consecutive_errors,
            },
            recorder: None,
        })
    }
}

impl CaptureBackend for WebcamBackend {
    fn name(&self) -> &str {
        "webcam"
    }

    fn start_continuous(&mut self, sink: VideoSink) -> Result<()> {
        let (index, width, height, fps) = (self.index, self.width, self.height, self.fps);
        let recorder = Recorder::spawn(
            "webcam",
            move || WebcamSource::open(index, width, height, fps),
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
    }
}

impl Drop for WebcamBackend {
    fn drop(&mut self) {
        self.release();
    }
}

struct WebcamSource {
    camera: Camera,
}

impl WebcamSource {
    fn open(index: u32, width: u32, height: u32, fps: u32) -> Result<Self> {
        info!("Initializing webcam {} at {}x{}", index, width, height);

        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
            CameraFormat::new(Resolution::new(width, height), FrameFormat::MJPEG, fps),
        ));
        let mut camera = Camera::new(CameraIndex::Index(index), requested)
            .map_err(|e| CaptureError::DeviceUnavailable(format!("failed to open camera: {e}")))?;
        camera.open_stream().map_err(|e| {
            CaptureError::DeviceUnavailable(format!("failed to open camera stream: {e}"))
        })?;

        info!("Webcam initialized successfully");
        Ok(Self { camera })
    }
}

impl FrameSource for WebcamSource {
    fn grab(&mut self) -> Result<RawFrame> {
        let frame = self
            .camera
            .frame()
            .map_err(|e| CaptureError::CaptureFailed(format!("failed to capture frame: {e}")))?;
        let decoded = frame
            .decode_image::<RgbFormat>()
            .map_err(|e| CaptureError::CaptureFailed(format!("failed to decode frame: {e}")))?;

        let (width, height) = (decoded.width(), decoded.height());
        RgbImage::from_raw(width, height, decoded.into_raw())
            .map(RawFrame::Rgb)
            .ok_or_else(|| CaptureError::CaptureFailed("decoded frame has the wrong size".into()))
    }
}

impl Drop for WebcamSource {
    fn drop(&mut self) {
        let _ = self.camera.stop_stream();
    }
}
