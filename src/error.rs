use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Capture error: {0}")]
    CaptureError(String),

    #[error("Video device busy [{0}]")]
    DeviceBusy(String),

    #[error("Video device lost [{device}]: {reason}")]
    DeviceLost { device: String, reason: String },

    #[error("Encode error: {0}")]
    EncodeError(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl AppError {
    /// Short machine-readable code, used as the log throttling key
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) | AppError::ConfigParse(_) => "config",
            AppError::NotFound(_) => "not_found",
            AppError::CaptureError(_) => "capture",
            AppError::DeviceBusy(_) => "device_busy",
            AppError::DeviceLost { .. } => "device_lost",
            AppError::EncodeError(_) => "encode",
            AppError::Transport(_) | AppError::WebSocket(_) => "transport",
            AppError::Protocol(_) | AppError::Serialization(_) => "protocol",
            AppError::Timeout(_) => "timeout",
            AppError::Cancelled(_) => "cancelled",
            AppError::Io(_) => "io",
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let lost = AppError::DeviceLost {
            device: "/dev/video0".to_string(),
            reason: "ENODEV".to_string(),
        };
        assert_eq!(lost.code(), "device_lost");
        assert_eq!(
            lost.to_string(),
            "Video device lost [/dev/video0]: ENODEV"
        );

        let parse: AppError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(parse.code(), "protocol");
    }
}
