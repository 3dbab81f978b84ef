//! V4L2 camera backend built on the `v4l` crate

use bytes::Bytes;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::io::traits::CaptureStream as _;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Format;

use super::backend::{is_device_busy_error, CameraBackend, CameraStream, VideoDevice};
use super::capture::CaptureConfig;
use super::format::{PixelFormat, Resolution};
use super::frame::VideoFrame;
use crate::error::{AppError, Result};

/// V4L2 backend scanning `/dev/video*`
pub struct V4l2Backend {
    dev_dir: PathBuf,
    sysfs_dir: PathBuf,
}

impl V4l2Backend {
    pub fn new() -> Self {
        Self::with_dirs("/dev", "/sys/class/video4linux")
    }

    /// Use alternative device and sysfs roots
    pub fn with_dirs(dev_dir: impl AsRef<Path>, sysfs_dir: impl AsRef<Path>) -> Self {
        Self {
            dev_dir: dev_dir.as_ref().to_path_buf(),
            sysfs_dir: sysfs_dir.as_ref().to_path_buf(),
        }
    }

    /// List `videoN` nodes ordered by N
    fn scan_nodes(&self) -> Result<Vec<(String, PathBuf)>> {
        let entries = fs::read_dir(&self.dev_dir).map_err(|e| {
            AppError::CaptureError(format!("Failed to read {}: {}", self.dev_dir.display(), e))
        })?;

        let mut nodes: Vec<(u32, String, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_str()?.to_string();
                let index = name.strip_prefix("video")?.parse::<u32>().ok()?;
                Some((index, name, entry.path()))
            })
            .collect();

        nodes.sort_by_key(|(index, _, _)| *index);
        Ok(nodes.into_iter().map(|(_, name, path)| (name, path)).collect())
    }

    fn sysfs_label(&self, node: &str) -> Option<String> {
        fs::read_to_string(self.sysfs_dir.join(node).join("name"))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// UVC exposes a metadata node next to every capture node; only index 0
    /// carries video.
    fn is_secondary_node(&self, node: &str) -> bool {
        fs::read_to_string(self.sysfs_dir.join(node).join("index"))
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .map(|index| index > 0)
            .unwrap_or(false)
    }

    /// Open the node just long enough to read its capabilities
    fn probe_node(path: &Path) -> io::Result<Option<String>> {
        let device = Device::with_path(path)?;
        let caps = device.query_caps()?;
        let is_capture = caps.capabilities.contains(Flags::VIDEO_CAPTURE)
            || caps.capabilities.contains(Flags::VIDEO_CAPTURE_MPLANE);
        Ok(is_capture.then_some(caps.card))
    }
}

impl Default for V4l2Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraBackend for V4l2Backend {
    fn name(&self) -> &str {
        "v4l2"
    }

    fn enumerate(&self, probe_labels: bool) -> Result<Vec<VideoDevice>> {
        let mut devices = Vec::new();

        for (node, path) in self.scan_nodes()? {
            if self.is_secondary_node(&node) {
                debug!("Skipping secondary video node: {:?}", path);
                continue;
            }

            // Kind filtering never depends on `probe_labels`; QUERYCAP starts no stream
            let card = match Self::probe_node(&path) {
                Ok(Some(card)) => Some(card),
                Ok(None) => {
                    debug!("Skipping non-capture device: {:?}", path);
                    continue;
                }
                Err(e) => {
                    // Permission denied or busy: keep the device, label unknown
                    debug!("Failed to probe {:?}: {}", path, e);
                    None
                }
            };

            let id = path.to_string_lossy().to_string();
            let label = match card {
                Some(card) if probe_labels => card,
                _ => self.sysfs_label(&node).unwrap_or_default(),
            };

            devices.push(VideoDevice { id, label });
        }

        debug!("Found {} video capture devices", devices.len());
        Ok(devices)
    }

    fn open(&self, device_id: &str, config: &CaptureConfig) -> Result<Box<dyn CameraStream>> {
        let device = Device::with_path(device_id).map_err(|e| open_error(device_id, e))?;

        let mut fmt: Format = device
            .format()
            .map_err(|e| AppError::CaptureError(format!("Failed to get format: {}", e)))?;
        fmt.width = config.resolution.width;
        fmt.height = config.resolution.height;
        fmt.fourcc = config.format.to_fourcc();

        let actual = device
            .set_format(&fmt)
            .map_err(|e| open_error(device_id, e))?;

        let format = PixelFormat::from_fourcc(actual.fourcc).ok_or_else(|| {
            AppError::CaptureError(format!(
                "Device {} negotiated unsupported format {}",
                device_id, actual.fourcc
            ))
        })?;
        let resolution = Resolution::new(actual.width, actual.height);

        if actual.width != config.resolution.width || actual.height != config.resolution.height {
            warn!(
                "Requested {}, got {} on {}",
                config.resolution, resolution, device_id
            );
        }

        if config.fps > 0 {
            if let Err(e) = device.set_params(&Parameters::with_fps(config.fps)) {
                warn!("Failed to set hardware FPS: {}", e);
            }
        }

        let mut stream = MmapStream::with_buffers(&device, Type::VideoCapture, config.buffer_count)
            .map_err(|e| open_error(device_id, e))?;
        stream.set_timeout(config.read_timeout);

        info!(
            "Opened {} at {} {} stride={}",
            device_id, resolution, format, actual.stride
        );

        Ok(Box::new(V4l2Stream {
            stream,
            _device: device,
            resolution,
            format,
            stride: actual.stride,
        }))
    }
}

fn open_error(device_id: &str, err: io::Error) -> AppError {
    if is_device_busy_error(&err) {
        AppError::DeviceBusy(device_id.to_string())
    } else if err.kind() == io::ErrorKind::NotFound {
        AppError::NotFound(format!("video device {}", device_id))
    } else {
        AppError::CaptureError(format!("Failed to open device {}: {}", device_id, err))
    }
}

/// Memory-mapped V4L2 capture stream
struct V4l2Stream {
    stream: MmapStream<'static>,
    _device: Device,
    resolution: Resolution,
    format: PixelFormat,
    stride: u32,
}

impl CameraStream for V4l2Stream {
    fn next_frame(&mut self) -> io::Result<VideoFrame> {
        let (buf, meta) = self.stream.next()?;
        let used = (meta.bytesused as usize).min(buf.len());
        Ok(VideoFrame::new(
            Bytes::copy_from_slice(&buf[..used]),
            self.resolution,
            self.format,
            self.stride,
            meta.sequence as u64,
        ))
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn format(&self) -> PixelFormat {
        self.format
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_node(dev: &Path, sysfs: &Path, node: &str, name: Option<&str>, index: u32) {
        fs::write(dev.join(node), b"").unwrap();
        let dir = sysfs.join(node);
        fs::create_dir_all(&dir).unwrap();
        if let Some(name) = name {
            fs::write(dir.join("name"), format!("{}\n", name)).unwrap();
        }
        fs::write(dir.join("index"), format!("{}\n", index)).unwrap();
    }

    #[test]
    fn test_enumerate_without_probe_uses_sysfs() {
        let dev = tempfile::tempdir().unwrap();
        let sysfs = tempfile::tempdir().unwrap();

        fake_node(dev.path(), sysfs.path(), "video10", Some("USB Camera B"), 0);
        fake_node(dev.path(), sysfs.path(), "video2", Some("USB Camera A"), 0);
        fake_node(dev.path(), sysfs.path(), "video3", Some("USB Camera A"), 1);
        fake_node(dev.path(), sysfs.path(), "video4", None, 0);
        fs::write(dev.path().join("vbi0"), b"").unwrap();

        let backend = V4l2Backend::with_dirs(dev.path(), sysfs.path());
        let devices = backend.enumerate(false).unwrap();

        let ids: Vec<_> = devices
            .iter()
            .map(|d| Path::new(&d.id).file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["video2", "video4", "video10"]);
        assert_eq!(devices[0].label, "USB Camera A");
        assert_eq!(devices[1].label, "");
        assert_eq!(devices[2].label, "USB Camera B");
    }

    #[test]
    fn test_label_mode_does_not_change_ids() {
        let dev = tempfile::tempdir().unwrap();
        let sysfs = tempfile::tempdir().unwrap();

        fake_node(dev.path(), sysfs.path(), "video0", Some("USB Camera"), 0);
        fake_node(dev.path(), sysfs.path(), "video1", Some("USB Camera"), 1);
        fake_node(dev.path(), sysfs.path(), "video10", Some("bcm2835-codec-decode"), 0);

        let backend = V4l2Backend::with_dirs(dev.path(), sysfs.path());
        let ids = |devices: Vec<VideoDevice>| -> Vec<String> {
            devices.into_iter().map(|d| d.id).collect()
        };
        assert_eq!(
            ids(backend.enumerate(true).unwrap()),
            ids(backend.enumerate(false).unwrap())
        );
    }

    #[test]
    fn test_enumerate_missing_dev_dir_fails() {
        let backend = V4l2Backend::with_dirs("/nonexistent/dev", "/nonexistent/sys");
        assert!(backend.enumerate(false).is_err());
    }

    #[test]
    fn test_open_missing_device() {
        let backend = V4l2Backend::new();
        let err = backend
            .open("/nonexistent/video0", &CaptureConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
