//! Camera backend abstraction
//!
//! The device registry and capture source talk to hardware only through
//! [`CameraBackend`]. All calls are blocking and are made from
//! `spawn_blocking` workers.

use serde::{Deserialize, Serialize};
use std::io;

use super::capture::CaptureConfig;
use super::format::{PixelFormat, Resolution};
use super::frame::VideoFrame;
use crate::error::Result;

/// A video input device as seen by the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoDevice {
    /// Stable identifier (device node path for V4L2)
    pub id: String,
    /// Human-readable name, empty when it could not be read
    pub label: String,
}

impl VideoDevice {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }

    /// Label for display, falling back to the id
    pub fn display_name(&self) -> String {
        if self.label.is_empty() {
            format!("Camera {}", self.id)
        } else {
            self.label.clone()
        }
    }
}

/// Which backend the client drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Linux V4L2 devices under /dev/video*
    #[default]
    V4l2,
    /// Generated test pattern, no hardware needed
    Synthetic,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "v4l2" | "v4l" => Ok(BackendKind::V4l2),
            "synthetic" | "test-pattern" => Ok(BackendKind::Synthetic),
            _ => Err(format!("Unknown camera backend: {}", s)),
        }
    }
}

/// Hardware access used by the registry and the capture source
pub trait CameraBackend: Send + Sync + 'static {
    /// Backend name for logging
    fn name(&self) -> &str;

    /// Enumerate video input devices.
    ///
    /// With `probe_labels` the backend may briefly open each device to read
    /// permission-gated metadata; it must release it before returning.
    fn enumerate(&self, probe_labels: bool) -> Result<Vec<VideoDevice>>;

    /// Acquire an exclusive live stream on `device_id`
    fn open(&self, device_id: &str, config: &CaptureConfig) -> Result<Box<dyn CameraStream>>;
}

/// A live, exclusively owned stream. Dropping it releases the hardware.
pub trait CameraStream: Send {
    /// Block until the next frame arrives or the read times out
    fn next_frame(&mut self) -> io::Result<VideoFrame>;

    /// Negotiated resolution
    fn resolution(&self) -> Resolution;

    /// Negotiated pixel format
    fn format(&self) -> PixelFormat;
}

/// OS error codes that mean the device went away mid-stream
pub fn is_device_lost_error(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(6)     // ENXIO
            | Some(19)  // ENODEV
            | Some(5)   // EIO
            | Some(32)  // EPIPE
            | Some(108) // ESHUTDOWN
    )
}

/// OS error codes that mean another process holds the device
pub fn is_device_busy_error(err: &io::Error) -> bool {
    err.raw_os_error() == Some(16) // EBUSY
        || err.to_string().to_lowercase().contains("busy")
}
