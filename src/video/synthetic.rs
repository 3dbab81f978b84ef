//! Synthetic camera backend
//!
//! Produces a moving RGB24 gradient. Used when no hardware is present
//! (`--backend synthetic`) and as the camera in tests. Devices can be
//! plugged, unplugged and marked busy at runtime.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::backend::{CameraBackend, CameraStream, VideoDevice};
use super::capture::CaptureConfig;
use super::format::{PixelFormat, Resolution};
use super::frame::VideoFrame;
use crate::error::{AppError, Result};

struct SyntheticState {
    devices: RwLock<Vec<VideoDevice>>,
    busy: RwLock<HashSet<String>>,
    open_delay: RwLock<Duration>,
    device_delays: RwLock<HashMap<String, Duration>>,
    resolution: Resolution,
    fps: u32,
    opens: AtomicU64,
    active: AtomicUsize,
}

/// Test-pattern camera backend
#[derive(Clone)]
pub struct SyntheticBackend {
    state: Arc<SyntheticState>,
}

impl SyntheticBackend {
    pub fn new(devices: Vec<VideoDevice>) -> Self {
        Self::with_format(devices, Resolution::new(64, 48), 30)
    }

    pub fn with_format(devices: Vec<VideoDevice>, resolution: Resolution, fps: u32) -> Self {
        Self {
            state: Arc::new(SyntheticState {
                devices: RwLock::new(devices),
                busy: RwLock::new(HashSet::new()),
                open_delay: RwLock::new(Duration::ZERO),
                device_delays: RwLock::new(HashMap::new()),
                resolution,
                fps: fps.max(1),
                opens: AtomicU64::new(0),
                active: AtomicUsize::new(0),
            }),
        }
    }

    /// One device named like a typical built-in webcam
    pub fn single() -> Self {
        Self::new(vec![VideoDevice::new("synthetic0", "Synthetic Camera")])
    }

    /// Replace the device set (simulates hot-plug)
    pub fn set_devices(&self, devices: Vec<VideoDevice>) {
        *self.state.devices.write() = devices;
    }

    /// Make `open` fail for a device as if another process held it
    pub fn set_busy(&self, device_id: &str, busy: bool) {
        let mut set = self.state.busy.write();
        if busy {
            set.insert(device_id.to_string());
        } else {
            set.remove(device_id);
        }
    }

    /// Delay every acquisition (simulates slow permission prompts)
    pub fn set_open_delay(&self, delay: Duration) {
        *self.state.open_delay.write() = delay;
    }

    /// Delay acquisitions of one device only
    pub fn set_device_open_delay(&self, device_id: &str, delay: Duration) {
        self.state
            .device_delays
            .write()
            .insert(device_id.to_string(), delay);
    }

    /// Number of successful acquisitions so far
    pub fn open_count(&self) -> u64 {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Number of streams currently holding a device
    pub fn active_streams(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    fn is_present(&self, device_id: &str) -> bool {
        self.state.devices.read().iter().any(|d| d.id == device_id)
    }
}

impl CameraBackend for SyntheticBackend {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn enumerate(&self, probe_labels: bool) -> Result<Vec<VideoDevice>> {
        let devices = self.state.devices.read().clone();
        if probe_labels {
            Ok(devices)
        } else {
            // Labels are only readable after a probe
            Ok(devices
                .into_iter()
                .map(|d| VideoDevice::new(d.id, ""))
                .collect())
        }
    }

    fn open(&self, device_id: &str, _config: &CaptureConfig) -> Result<Box<dyn CameraStream>> {
        let delay = self
            .state
            .device_delays
            .read()
            .get(device_id)
            .copied()
            .unwrap_or_else(|| *self.state.open_delay.read());
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        if !self.is_present(device_id) {
            return Err(AppError::NotFound(format!("video device {}", device_id)));
        }
        if self.state.busy.read().contains(device_id) {
            return Err(AppError::DeviceBusy(device_id.to_string()));
        }

        self.state.opens.fetch_add(1, Ordering::SeqCst);
        self.state.active.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(SyntheticStream {
            backend: self.clone(),
            device_id: device_id.to_string(),
            sequence: 0,
        }))
    }
}

struct SyntheticStream {
    backend: SyntheticBackend,
    device_id: String,
    sequence: u64,
}

impl CameraStream for SyntheticStream {
    fn next_frame(&mut self) -> io::Result<VideoFrame> {
        let state = &self.backend.state;
        std::thread::sleep(Duration::from_millis(1000 / state.fps as u64));

        if !self.backend.is_present(&self.device_id) {
            return Err(io::Error::from_raw_os_error(19));
        }

        self.sequence += 1;
        let res = state.resolution;
        let shift = (self.sequence % 256) as u8;
        let mut data = Vec::with_capacity(res.pixels() * 3);
        for y in 0..res.height {
            for x in 0..res.width {
                data.push((x as u8).wrapping_add(shift));
                data.push(y as u8);
                data.push(shift);
            }
        }

        Ok(VideoFrame::from_vec(
            data,
            res,
            PixelFormat::Rgb24,
            res.width * 3,
            self.sequence,
        ))
    }

    fn resolution(&self) -> Resolution {
        self.backend.state.resolution
    }

    fn format(&self) -> PixelFormat {
        PixelFormat::Rgb24
    }
}

impl Drop for SyntheticStream {
    fn drop(&mut self) {
        self.backend.state.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_lifecycle() {
        let backend = SyntheticBackend::single();
        let mut stream = backend.open("synthetic0", &CaptureConfig::default()).unwrap();
        assert_eq!(backend.active_streams(), 1);

        let frame = stream.next_frame().unwrap();
        assert_eq!(frame.format, PixelFormat::Rgb24);
        assert_eq!(frame.len(), 64 * 48 * 3);

        drop(stream);
        assert_eq!(backend.active_streams(), 0);
        assert_eq!(backend.open_count(), 1);
    }

    #[test]
    fn test_busy_and_missing() {
        let backend = SyntheticBackend::single();
        backend.set_busy("synthetic0", true);
        assert!(matches!(
            backend.open("synthetic0", &CaptureConfig::default()).err(),
            Some(AppError::DeviceBusy(_))
        ));
        assert!(matches!(
            backend.open("nope", &CaptureConfig::default()).err(),
            Some(AppError::NotFound(_))
        ));
    }

    #[test]
    fn test_unplug_reports_device_lost() {
        let backend = SyntheticBackend::single();
        let mut stream = backend.open("synthetic0", &CaptureConfig::default()).unwrap();
        backend.set_devices(vec![]);
        let err = stream.next_frame().unwrap_err();
        assert!(super::super::backend::is_device_lost_error(&err));
    }

    #[test]
    fn test_labels_require_probe() {
        let backend = SyntheticBackend::single();
        assert_eq!(backend.enumerate(true).unwrap()[0].label, "Synthetic Camera");
        assert_eq!(backend.enumerate(false).unwrap()[0].label, "");
    }
}
