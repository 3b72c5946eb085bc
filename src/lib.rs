pub mod capture;
pub mod error;
pub mod pipeline;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capture::frame::{Frame, ImageFormat, PixelFormat, VersionedFrame};
pub use capture::{Acquirer, CaptureBackend, VideoSink};
pub use error::{CaptureError, Result};
pub use pipeline::{
    CaptureCoordinator, CoordinatorFactory, CoordinatorState, CoordinatorStats, FrameBroadcaster,
    StatsSnapshot, StillCaptureQueue, StillTicket, VideoReader,
};

/// Environment prefix for configuration overrides, e.g. `CAMSHARE__VIDEO__FPS=15`
pub const ENV_PREFIX: &str = "CAMSHARE";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub video: VideoConfig,
    pub still: StillConfig,
    pub coordinator: CoordinatorConfig,
}

/// Which capture backend to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Probe for a hardware node first, then fall back to the webcam
    Auto,
    Hardware,
    Webcam,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    pub backend: BackendKind,
    /// V4L2 node; empty means auto-detect
    pub device: String,
    pub webcam_index: u32,
    pub pixel_format: PixelFormat,
    pub buffer_count: u32,
    /// Consecutive grab failures tolerated before the stream is declared dead
    pub max_consecutive_errors: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StillConfig {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: ImageFormat,
    pub jpeg_quality: u8,
    pub grab_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub video_timeout_ms: Option<u64>,
    pub still_timeout_ms: Option<u64>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            device: String::new(),
            webcam_index: 0,
            pixel_format: PixelFormat::Mjpeg,
            buffer_count: 4,
            max_consecutive_errors: 10,
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            jpeg_quality: 80,
        }
    }
}

impl Default for StillConfig {
    fn default() -> Self {
        Self {
            width: None,
            height: None,
            format: ImageFormat::Jpeg,
            jpeg_quality: 90,
            grab_timeout_ms: 2_000,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            video_timeout_ms: Some(5_000),
            still_timeout_ms: Some(10_000),
        }
    }
}

impl StillConfig {
    /// Requested still resolution, if both dimensions are set
    pub fn size(&self) -> Option<(u32, u32)> {
        self.width.zip(self.height)
    }

    pub fn grab_timeout(&self) -> Duration {
        Duration::from_millis(self.grab_timeout_ms)
    }
}

impl CoordinatorConfig {
    pub fn video_timeout(&self) -> Option<Duration> {
        self.video_timeout_ms.map(Duration::from_millis)
    }

    pub fn still_timeout(&self) -> Option<Duration> {
        self.still_timeout_ms.map(Duration::from_millis)
    }
}

impl Config {
    /// Load defaults, then the optional TOML file, then `CAMSHARE__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Self::defaults_builder()?;
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );
        Ok(builder.build()?.try_deserialize()?)
    }

    /// Parse a TOML document layered over the defaults
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let builder = Self::defaults_builder()?
            .add_source(config::File::from_str(toml, config::FileFormat::Toml));
        Ok(builder.build()?.try_deserialize()?)
    }

    fn defaults_builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        Ok(config::Config::builder().add_source(config::Config::try_from(&Config::default())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_resolutions() {
        let config = Config::default();
        assert_eq!((config.video.width, config.video.height), (640, 480));
        assert_eq!(config.still.size(), None);
        assert_eq!(config.still.format, ImageFormat::Jpeg);
        assert_eq!(config.capture.backend, BackendKind::Auto);
    }

    #[test]
    fn test_toml_overrides_layer_over_defaults() {
        let config = Config::from_toml_str(
            r#"
            [capture]
            backend = "webcam"

            [still]
            width = 1024
            height = 768
            format = "png"

            [coordinator]
            still_timeout_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.capture.backend, BackendKind::Webcam);
        assert_eq!(config.still.size(), Some((1024, 768)));
        assert_eq!(config.still.format, ImageFormat::Png);
        assert_eq!(
            config.coordinator.still_timeout(),
            Some(Duration::from_millis(250))
        );
        // untouched sections keep their defaults
        assert_eq!(config.video, VideoConfig::default());
    }

    #[test]
    fn test_environment_overrides_defaults() {
        std::env::set_var("CAMSHARE__VIDEO__FPS", "15");
        std::env::set_var("CAMSHARE__STILL__WIDTH", "800");
        let config = Config::load(None);
        std::env::remove_var("CAMSHARE__VIDEO__FPS");
        std::env::remove_var("CAMSHARE__STILL__WIDTH");

        let config = config.unwrap();
        assert_eq!(config.video.fps, 15);
        assert_eq!(config.still.width, Some(800));
        assert_eq!(config.video.width, VideoConfig::default().width);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = Config::from_toml_str("[capture]\nbackend = \"floppy\"").unwrap_err();
        assert!(matches!(err, CaptureError::Config(_)));
    }
}
