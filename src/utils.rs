use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use v4l::{capability::Flags, video::Capture, Device, FourCC};

use crate::capture::frame::PixelFormat;
use crate::capture::{Acquirer, CaptureBackend, V4l2Backend};
use crate::error::{CaptureError, Result};
use crate::{BackendKind, Config};

// Detected capture device info
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FoundDevice {
    pub path: String,
    pub format: PixelFormat,
}

impl FoundDevice {
    pub fn new(path: String, format: PixelFormat) -> Self {
        Self { path, format }
    }
}

/// Auto-detect best capture device, preferring MJPEG over YUYV
pub fn auto_detect_device() -> Result<FoundDevice> {
    info!("Auto-detecting capture devices...");

    let mut fallback = None;
    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        // Check for capture capability
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }
        let Ok(formats) = dev.enum_formats() else {
            continue;
        };

        for fmt in formats {
            if fmt.fourcc == FourCC::new(b"MJPG") {
                info!("Found MJPEG device: {} - {}", path, caps.card);
                return Ok(FoundDevice::new(path, PixelFormat::Mjpeg));
            } else if fmt.fourcc == FourCC::new(b"YUYV") && fallback.is_none() {
                info!("Found YUYV device: {} - {}", path, caps.card);
                fallback = Some(FoundDevice::new(path.clone(), PixelFormat::Yuyv));
            }
        }
    }

    fallback.ok_or_else(|| {
        CaptureError::DeviceUnavailable("No suitable capture device found".into())
    })
}

/// Open the backend `config` asks for. `auto` tries hardware, then the webcam.
pub fn acquire_from_config(config: &Config) -> Result<Box<dyn CaptureBackend>> {
    match config.capture.backend {
        BackendKind::Hardware => Ok(Box::new(open_hardware(config)?)),
        BackendKind::Webcam => open_webcam(config),
        BackendKind::Auto => match open_hardware(config) {
            Ok(backend) => Ok(Box::new(backend)),
            Err(e) => {
                warn!("No hardware capture device ({}), trying webcam", e);
                open_webcam(config)
            }
        },
    }
}

/// [`Acquirer`] over [`acquire_from_config`]
pub fn config_acquirer(config: Config) -> Acquirer {
    Arc::new(move || -> Result<Box<dyn CaptureBackend>> { acquire_from_config(&config) })
}

fn open_hardware(config: &Config) -> Result<V4l2Backend> {
    let found = if config.capture.device.is_empty() {
        auto_detect_device()?
    } else {
        FoundDevice::new(config.capture.device.clone(), config.capture.pixel_format)
    };
    info!("Using capture device: {:?}", found);
    V4l2Backend::open(config, &found)
}

#[cfg(feature = "webcam")]
fn open_webcam(config: &Config) -> Result<Box<dyn CaptureBackend>> {
    Ok(Box::new(crate::capture::WebcamBackend::open(config)?))
}

#[cfg(not(feature = "webcam"))]
fn open_webcam(_config: &Config) -> Result<Box<dyn CaptureBackend>> {
    Err(CaptureError::DeviceUnavailable(
        "built without webcam support".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_hardware_node_is_unavailable() {
        let mut config = Config::default();
        config.capture.backend = BackendKind::Hardware;
        config.capture.device = "/dev/camshare-does-not-exist".into();

        let err = acquire_from_config(&config).err().unwrap();
        assert!(matches!(err, CaptureError::DeviceUnavailable(_)));
    }
}
