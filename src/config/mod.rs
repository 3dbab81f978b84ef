//! Client configuration
//!
//! Sources, lowest to highest precedence: built-in defaults, an optional TOML
//! file, the `WASHCAM_WS_URL` environment variable, command line flags.

mod schema;

pub use schema::*;

use std::path::Path;
use tracing::debug;

use crate::error::{AppError, Result};

/// Environment variable holding the WebSocket endpoint
pub const URL_ENV: &str = "WASHCAM_WS_URL";

impl ClientConfig {
    /// Parse a TOML document. Missing sections and fields take defaults.
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&text)?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load from `path` if given, otherwise start from defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Apply an endpoint URL from the environment, if set
    pub fn apply_env_url(&mut self, value: Option<String>) {
        if let Some(url) = value.filter(|u| !u.trim().is_empty()) {
            self.transport.url = url;
        }
    }

    /// Serialize back to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| AppError::Config(format!("Failed to serialize config: {}", e)))
    }
}
