//! Platform Error Types

use thiserror::Error;

/// Errors from hardware endpoint operations
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("No audio host or device available")]
    NoDeviceAvailable,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildFailed(String),

    #[error("Failed to start audio stream: {0}")]
    StreamStartFailed(String),

    #[error("Failed to stop audio stream: {0}")]
    StreamStopFailed(String),

    #[error("Unsupported stream configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("Endpoint is not running")]
    NotRunning,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for platform operations
pub type PlatformResult<T> = Result<T, PlatformError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PlatformError::DeviceNotFound("hw:0,0".into());
        assert!(err.to_string().contains("hw:0,0"));
    }
}
