use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Encoded image with zero-copy semantics
#[derive(Debug, Clone)]
pub struct Frame {
    /// Immutable encoded bytes - can be shared across threads without copying
    pub data: Bytes,

    /// Encoding of `data`
    pub format: ImageFormat,

    /// When the frame was handed to the core
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(data: impl Into<Bytes>, format: ImageFormat) -> Self {
        Self {
            data: data.into(),
            format,
            captured_at: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A video frame together with the broadcast version it was published under
#[derive(Debug, Clone)]
pub struct VersionedFrame {
    pub frame: Frame,
    pub version: u64,
}

/// Encodings the core can hand out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
        }
    }
}

/// Raw pixel formats negotiated with V4L2 devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Mjpeg,
    Yuyv,
}
