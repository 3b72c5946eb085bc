//! Capture error types

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the capture core and its backends.
///
/// Cloneable so that a single terminal failure can be handed to every
/// caller that was waiting when the coordinator stopped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    /// The capture device could not be acquired or started
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A single frame or still could not be produced
    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    /// The coordinator has shut down
    #[error("Capture coordinator is stopped")]
    CoordinatorStopped,

    /// A caller-supplied or configured deadline elapsed
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CaptureError>;

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::CaptureFailed(err.to_string())
    }
}

impl From<image::ImageError> for CaptureError {
    fn from(err: image::ImageError) -> Self {
        CaptureError::CaptureFailed(err.to_string())
    }
}

impl From<config::ConfigError> for CaptureError {
    fn from(err: config::ConfigError) -> Self {
        CaptureError::Config(err.to_string())
    }
}
