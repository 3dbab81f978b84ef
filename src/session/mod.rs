//! Session state machine: transport phases, progress counters and the
//! one-shot completion latch

pub mod reconciler;
pub mod state;

pub use reconciler::Reconciler;
pub use state::{normalized_percent, Meter, SessionPhase, SessionState};
