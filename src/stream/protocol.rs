//! Wire messages exchanged with the inference service
//!
//! Outbound frames are bare data URL strings and have no type here.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{AppError, Result};
use crate::session::state::DEFAULT_DENOMINATOR;

fn default_max_count() -> u32 {
    DEFAULT_DENOMINATOR
}

/// Inbound progress report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    /// Category -> count; replaces the previous map entirely
    pub counters: BTreeMap<String, u32>,
    pub status: String,
    #[serde(default = "default_max_count")]
    pub max_count: u32,
    #[serde(default)]
    pub message: String,
}

impl StatusMessage {
    /// Parse one inbound payload
    pub fn parse(payload: &str) -> Result<Self> {
        serde_json::from_str(payload)
            .map_err(|e| AppError::Protocol(format!("malformed status message: {}", e)))
    }

    /// Parse a binary payload, which must be UTF-8 JSON
    pub fn parse_bytes(payload: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| AppError::Protocol(format!("binary payload is not UTF-8: {}", e)))?;
        Self::parse(text)
    }
}

/// Outbound control message sent once after the handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub action: String,
    #[serde(rename = "cameraUrl", skip_serializing_if = "Option::is_none", default)]
    pub camera_url: Option<String>,
}

impl ControlMessage {
    /// `{"action":"start"}`, optionally naming a remote camera
    pub fn start(camera_url: Option<String>) -> Self {
        Self {
            action: "start".to_string(),
            camera_url,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_message() {
        let msg = StatusMessage::parse(
            r#"{"counters":{"lather":40,"rinse":0},"status":"in_progress","max_count":80,"message":""}"#,
        )
        .unwrap();
        assert_eq!(msg.counters["lather"], 40);
        assert_eq!(msg.max_count, 80);
        assert_eq!(msg.status, "in_progress");
    }

    #[test]
    fn test_optional_fields_default() {
        let msg = StatusMessage::parse(r#"{"counters":{},"status":"waiting"}"#).unwrap();
        assert_eq!(msg.max_count, 100);
        assert_eq!(msg.message, "");
    }

    #[test]
    fn test_required_fields_enforced() {
        assert!(StatusMessage::parse(r#"{"status":"x"}"#).is_err());
        assert!(StatusMessage::parse(r#"{"counters":{}}"#).is_err());
        assert!(StatusMessage::parse("not json").is_err());
        assert!(StatusMessage::parse(r#"{"counters":{"a":-1},"status":"x"}"#).is_err());
        assert!(StatusMessage::parse_bytes(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_control_message_shape() {
        assert_eq!(ControlMessage::start(None).to_json().unwrap(), r#"{"action":"start"}"#);
        assert_eq!(
            ControlMessage::start(Some("rtsp://cam/1".to_string())).to_json().unwrap(),
            r#"{"action":"start","cameraUrl":"rtsp://cam/1"}"#
        );
    }
}
