//! Camera discovery, capture and frame encoding
//!
//! Hardware access goes through [`CameraBackend`]: V4L2 in production, a
//! synthetic test pattern otherwise.

pub mod backend;
pub mod capture;
pub mod device;
pub mod encoder;
pub mod format;
pub mod frame;
pub mod synthetic;
pub mod v4l2_backend;

pub use backend::{BackendKind, CameraBackend, CameraStream, VideoDevice};
pub use capture::{CaptureConfig, CaptureSource, CaptureState, FrameReceiver};
pub use device::DeviceRegistry;
pub use encoder::{EncodedFrame, JpegEncoder};
pub use format::{PixelFormat, Resolution};
pub use frame::VideoFrame;
pub use synthetic::SyntheticBackend;
pub use v4l2_backend::V4l2Backend;

use std::sync::Arc;

/// Instantiate the configured backend
pub fn create_backend(kind: BackendKind) -> Arc<dyn CameraBackend> {
    match kind {
        BackendKind::V4l2 => Arc::new(V4l2Backend::new()),
        BackendKind::Synthetic => Arc::new(SyntheticBackend::single()),
    }
}
