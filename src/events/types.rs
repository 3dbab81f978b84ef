//! Client event types
//!
//! Defines all event types that can be broadcast through the event bus.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::session::SessionPhase;
use crate::video::VideoDevice;

/// Client event enumeration
///
/// Serialized as an adjacently tagged object:
/// ```json
/// {
///   "event": "session.completed",
///   "data": { "session_id": "…", "message": "All steps are followed. Passed!" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    // ============================================================================
    // Device Events
    // ============================================================================
    /// The set of video input devices changed
    #[serde(rename = "devices.changed")]
    DevicesChanged { devices: Vec<VideoDevice> },

    /// A device was selected for capture
    #[serde(rename = "device.selected")]
    DeviceSelected { device_id: String },

    // ============================================================================
    // Capture Events
    // ============================================================================
    /// Capture source state changed
    #[serde(rename = "capture.state_changed")]
    CaptureStateChanged {
        /// Device id if a device is bound
        device: Option<String>,
        /// "idle", "acquiring", "streaming", "failed", "device_lost"
        state: String,
    },

    /// Camera acquisition or streaming failed (non-fatal)
    #[serde(rename = "capture.failed")]
    CaptureFailed { device: String, reason: String },

    // ============================================================================
    // Session Events
    // ============================================================================
    /// Socket session moved to a new phase
    #[serde(rename = "session.phase_changed")]
    SessionPhaseChanged {
        session_id: Option<String>,
        phase: SessionPhase,
    },

    /// A status message from the server was applied
    #[serde(rename = "session.status")]
    StatusUpdated {
        status: String,
        counters: BTreeMap<String, u32>,
        denominator: u32,
    },

    /// The server reported completion (fires once per session)
    #[serde(rename = "session.completed")]
    Completed {
        session_id: Option<String>,
        message: String,
    },

    /// Session state was reset to baseline
    #[serde(rename = "session.reset")]
    SessionReset,
}

impl ClientEvent {
    /// Get the event name (for filtering)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::DevicesChanged { .. } => "devices.changed",
            Self::DeviceSelected { .. } => "device.selected",
            Self::CaptureStateChanged { .. } => "capture.state_changed",
            Self::CaptureFailed { .. } => "capture.failed",
            Self::SessionPhaseChanged { .. } => "session.phase_changed",
            Self::StatusUpdated { .. } => "session.status",
            Self::Completed { .. } => "session.completed",
            Self::SessionReset => "session.reset",
        }
    }

    /// Check if event matches a topic filter
    ///
    /// Supports exact names, `"*"`, and prefix wildcards like `"session.*"`.
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }
        let name = self.event_name();
        match topic.strip_suffix(".*") {
            Some(prefix) => name
                .strip_prefix(prefix)
                .map(|rest| rest.starts_with('.'))
                .unwrap_or(false),
            None => name == topic,
        }
    }
}
