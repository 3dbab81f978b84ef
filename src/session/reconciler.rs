//! Reconciler: folds transport phases and status messages into [`SessionState`]

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use super::state::{Meter, SessionPhase, SessionState, COMPLETE_STATUS};
use crate::events::{ClientEvent, EventBus};
use crate::stream::protocol::StatusMessage;

/// Single writer of the session state
///
/// All updates go through `send_modify`, so readers always observe a
/// consistent snapshot and updates apply in call order.
pub struct Reconciler {
    state: watch::Sender<SessionState>,
    events: Arc<EventBus>,
}

impl Reconciler {
    pub fn new(events: Arc<EventBus>) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self { state, events }
    }

    /// Current snapshot
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn meters(&self) -> Vec<Meter> {
        self.state.borrow().meters()
    }

    /// Start tracking a new socket session from baseline
    pub fn begin_session(&self, session_id: &str) {
        self.state.send_modify(|state| {
            let phase = state.phase;
            *state = SessionState {
                phase,
                status: phase.label().to_string(),
                session_id: Some(session_id.to_string()),
                ..SessionState::default()
            };
        });
        debug!("Session {} begins", session_id);
    }

    /// Record a transport phase change
    pub fn on_phase(&self, phase: SessionPhase) {
        let mut session_id = None;
        let changed = self.state.send_if_modified(|state| {
            session_id = state.session_id.clone();
            if state.phase == phase {
                return false;
            }
            state.phase = phase;
            state.status = phase.label().to_string();
            true
        });

        if changed {
            self.events.publish(ClientEvent::SessionPhaseChanged { session_id, phase });
        }
    }

    /// Apply one status message. Returns true if this message completed
    /// the session.
    pub fn on_status(&self, msg: StatusMessage) -> bool {
        let mut completion = None;

        self.state.send_modify(|state| {
            state.counters = msg.counters.clone();
            state.denominator = msg.max_count;
            state.status = msg.status.clone();

            if msg.status == COMPLETE_STATUS && !state.completed {
                state.completed = true;
                state.completion_message = msg.message.clone();
                state.notification_visible = true;
                state.completed_at = Some(Utc::now());
                completion = Some(state.session_id.clone());
            }
        });

        self.events.publish(ClientEvent::StatusUpdated {
            status: msg.status,
            counters: msg.counters,
            denominator: msg.max_count,
        });

        match completion {
            Some(session_id) => {
                info!("Session complete: {}", msg.message);
                self.events.publish(ClientEvent::Completed {
                    session_id,
                    message: msg.message,
                });
                true
            }
            None => false,
        }
    }

    /// Back to baseline counters and completion latch. The transport
    /// phase is left as is.
    pub fn reset(&self) {
        self.state.send_modify(|state| {
            let phase = state.phase;
            *state = SessionState {
                phase,
                status: phase.label().to_string(),
                ..SessionState::default()
            };
        });
        self.events.publish(ClientEvent::SessionReset);
        info!("Session state reset");
    }

    /// Hide the completion popup; the latch stays set
    pub fn dismiss_notification(&self) {
        self.state.send_if_modified(|state| {
            let was_visible = state.notification_visible;
            state.notification_visible = false;
            was_visible
        });
    }
}
