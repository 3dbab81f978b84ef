//! washcam - camera frame streaming client
//!
//! Samples a local camera at a fixed cadence, streams rotated JPEG frames to
//! an inference service over a WebSocket, and turns the service's progress
//! reports into per-category completion meters with a one-shot completion
//! notification.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod session;
pub mod stream;
pub mod utils;
pub mod video;

pub use client::Client;
pub use error::{AppError, Result};
