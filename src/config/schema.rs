use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::stream::{CaptureMode, SamplerConfig, TransportConfig};
use crate::video::backend::BackendKind;
use crate::video::capture::CaptureConfig;
use crate::video::format::{PixelFormat, Resolution};

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket endpoint settings
    pub transport: TransportSettings,
    /// Camera capture settings
    pub capture: CaptureSettings,
    /// Frame sampling settings
    pub sampler: SamplerSettings,
    /// Device discovery settings
    pub devices: DeviceSettings,
}

/// WebSocket endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportSettings {
    /// Endpoint URL (ws:// or wss://)
    pub url: String,
    /// Connect timeout in seconds (0 = wait indefinitely)
    pub connect_timeout_secs: u64,
    /// Local camera or server-pulled remote camera
    pub mode: CaptureMode,
    /// Camera URL sent to the server in remote mode
    pub camera_url: Option<String>,
    /// Send {"action":"start"} after connecting in local mode
    pub send_start_action: bool,
    /// Outbound frame queue capacity
    pub outbound_queue: usize,
    /// Give up on a socket write after this many seconds
    pub write_timeout_secs: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout_secs: 10,
            mode: CaptureMode::Local,
            camera_url: None,
            send_start_action: false,
            outbound_queue: 2,
            write_timeout_secs: 5,
        }
    }
}

/// Camera capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureSettings {
    /// Preferred device id (e.g., /dev/video0); first device when unset
    pub device: Option<String>,
    /// Camera backend
    pub backend: BackendKind,
    /// Resolution width
    pub width: u32,
    /// Resolution height
    pub height: u32,
    /// Frame rate
    pub fps: u32,
    /// Pixel format (e.g., "MJPEG", "YUYV")
    pub format: String,
    /// Acquisition timeout in seconds (0 = wait indefinitely)
    pub acquire_timeout_secs: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            device: None,
            backend: BackendKind::V4l2,
            width: 640,
            height: 480,
            fps: 15,
            format: "MJPEG".to_string(),
            acquire_timeout_secs: 5,
        }
    }
}

/// Frame sampling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SamplerSettings {
    /// Milliseconds between frames
    pub interval_ms: u64,
    /// JPEG quality (1-100)
    pub jpeg_quality: u8,
    /// Rotate frames by 180° before sending
    pub rotate_180: bool,
    /// Frames older than this are not sent
    pub max_frame_age_ms: u64,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            jpeg_quality: 80,
            rotate_180: true,
            max_frame_age_ms: 2000,
        }
    }
}

/// Device discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceSettings {
    /// Hot-plug poll interval in milliseconds (0 = no hot-plug tracking)
    pub hotplug_poll_ms: u64,
    /// Open devices briefly on startup to read their labels
    pub probe_labels: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            hotplug_poll_ms: 2000,
            probe_labels: true,
        }
    }
}

fn optional_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl ClientConfig {
    /// Reject configurations the client cannot run with
    pub fn validate(&self) -> Result<()> {
        let url = self.transport.url.trim();
        if url.is_empty() {
            return Err(AppError::Config(
                "WebSocket URL is required (--url or WASHCAM_WS_URL)".to_string(),
            ));
        }
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(AppError::Config(format!(
                "WebSocket URL must start with ws:// or wss://: {}",
                url
            )));
        }
        if self.sampler.interval_ms == 0 {
            return Err(AppError::Config("Sampling interval must be > 0".to_string()));
        }
        if !(1..=100).contains(&self.sampler.jpeg_quality) {
            return Err(AppError::Config(format!(
                "JPEG quality must be 1-100, got {}",
                self.sampler.jpeg_quality
            )));
        }
        if self.sampler.max_frame_age_ms == 0 {
            return Err(AppError::Config(
                "Maximum frame age must be > 0".to_string(),
            ));
        }
        if self.transport.write_timeout_secs == 0 {
            return Err(AppError::Config("Write timeout must be > 0".to_string()));
        }
        if self.transport.mode == CaptureMode::Remote && self.transport.camera_url.is_none() {
            return Err(AppError::Config(
                "Remote mode requires a camera URL".to_string(),
            ));
        }
        self.capture.pixel_format()?;
        Ok(())
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            url: self.transport.url.trim().to_string(),
            connect_timeout: optional_secs(self.transport.connect_timeout_secs),
            mode: self.transport.mode,
            camera_url: self.transport.camera_url.clone(),
            send_start_action: self.transport.send_start_action,
            outbound_queue: self.transport.outbound_queue.max(1),
            write_timeout: Duration::from_secs(self.transport.write_timeout_secs),
        }
    }

    pub fn capture_config(&self) -> Result<CaptureConfig> {
        Ok(CaptureConfig {
            resolution: Resolution::new(self.capture.width, self.capture.height),
            format: self.capture.pixel_format()?,
            fps: self.capture.fps,
            acquire_timeout: optional_secs(self.capture.acquire_timeout_secs),
            ..CaptureConfig::default()
        })
    }

    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            interval: Duration::from_millis(self.sampler.interval_ms),
            jpeg_quality: self.sampler.jpeg_quality,
            rotate_180: self.sampler.rotate_180,
            max_frame_age: Duration::from_millis(self.sampler.max_frame_age_ms),
        }
    }

    /// Hot-plug poll interval, `None` when disabled
    pub fn hotplug_interval(&self) -> Option<Duration> {
        (self.devices.hotplug_poll_ms > 0)
            .then(|| Duration::from_millis(self.devices.hotplug_poll_ms))
    }
}

impl CaptureSettings {
    pub fn pixel_format(&self) -> Result<PixelFormat> {
        self.format
            .parse::<PixelFormat>()
            .map_err(|e| AppError::Config(format!("Invalid capture format: {}", e)))
    }
}
