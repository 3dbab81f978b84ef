//! Observable session state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Denominator used until the server supplies one
pub const DEFAULT_DENOMINATOR: u32 = 100;

/// Status value that marks the task as finished
pub const COMPLETE_STATUS: &str = "complete";

/// Socket session lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    #[default]
    Idle,
    Connecting,
    Open,
    Closed,
    Errored,
}

impl SessionPhase {
    /// Status label shown before any server message overrides it
    pub fn label(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "Idle",
            SessionPhase::Connecting => "Connecting...",
            SessionPhase::Open => "Connected",
            SessionPhase::Closed => "Closed",
            SessionPhase::Errored => "Error",
        }
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Connecting => "connecting",
            SessionPhase::Open => "open",
            SessionPhase::Closed => "closed",
            SessionPhase::Errored => "errored",
        };
        write!(f, "{}", s)
    }
}

/// Everything the presentation layer reads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub phase: SessionPhase,
    /// User-facing status label
    pub status: String,
    /// Per-category counts from the latest status message
    pub counters: BTreeMap<String, u32>,
    pub denominator: u32,
    /// Latched once per session
    pub completed: bool,
    pub completion_message: String,
    pub notification_visible: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub session_id: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Idle,
            status: SessionPhase::Idle.label().to_string(),
            counters: BTreeMap::new(),
            denominator: DEFAULT_DENOMINATOR,
            completed: false,
            completion_message: String::new(),
            notification_visible: false,
            completed_at: None,
            session_id: None,
        }
    }
}

/// One progress meter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Meter {
    pub name: String,
    pub count: u32,
    pub percent: u8,
}

impl SessionState {
    /// Meters for every category, in name order
    pub fn meters(&self) -> Vec<Meter> {
        self.counters
            .iter()
            .map(|(name, &count)| Meter {
                name: name.clone(),
                count,
                percent: normalized_percent(count, self.denominator),
            })
            .collect()
    }
}

/// `clamp(round(count / denominator * 100), 0, 100)`; 0 when denominator is 0
pub fn normalized_percent(count: u32, denominator: u32) -> u8 {
    if denominator == 0 {
        return 0;
    }
    let percent = (count as f64 / denominator as f64 * 100.0).round();
    percent.clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_percent() {
        assert_eq!(normalized_percent(50, 100), 50);
        assert_eq!(normalized_percent(150, 100), 100);
        assert_eq!(normalized_percent(7, 0), 0);
        assert_eq!(normalized_percent(1, 3), 33);
        assert_eq!(normalized_percent(2, 3), 67);
        assert_eq!(normalized_percent(0, 100), 0);
    }

    #[test]
    fn test_baseline() {
        let state = SessionState::default();
        assert_eq!(state.denominator, DEFAULT_DENOMINATOR);
        assert_eq!(state.status, "Idle");
        assert!(!state.completed);
        assert!(state.meters().is_empty());
    }

    #[test]
    fn test_meters_in_name_order() {
        let mut state = SessionState::default();
        state.counters.insert("rinse".to_string(), 100);
        state.counters.insert("lather".to_string(), 40);
        state.denominator = 80;

        let meters = state.meters();
        assert_eq!(meters[0].name, "lather");
        assert_eq!(meters[0].percent, 50);
        assert_eq!(meters[1].name, "rinse");
        assert_eq!(meters[1].percent, 100);
    }

    #[test]
    fn test_phase_serde_and_labels() {
        assert_eq!(serde_json::to_string(&SessionPhase::Errored).unwrap(), "\"errored\"");
        assert_eq!(SessionPhase::Connecting.label(), "Connecting...");
        assert_eq!(SessionPhase::Open.to_string(), "open");
    }
}
