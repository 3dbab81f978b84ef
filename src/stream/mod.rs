//! Frame streaming to the inference service
//!
//! - [`sampler`]: fixed-cadence frame encoding
//! - [`transport`]: the WebSocket session
//! - [`protocol`]: wire message types

pub mod protocol;
pub mod sampler;
pub mod transport;

pub use protocol::{ControlMessage, StatusMessage};
pub use sampler::{FrameSampler, FrameSink, SamplerConfig, SamplerStats};
pub use transport::{CaptureMode, OutboundSink, SocketSession, TransportConfig};
