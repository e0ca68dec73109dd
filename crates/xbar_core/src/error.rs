//! Core Error Types

use thiserror::Error;

/// Errors of the PCM ring buffer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RingBufferError {
    #[error("Invalid ring buffer parameter: {0}")]
    InvalidParam(String),

    #[error("Timed out waiting for ring buffer space or data")]
    Timeout,

    #[error("Ring buffer access already committed")]
    AlreadyCommitted,
}

/// Errors of the crossbar core
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Component used before initialization")]
    NotInitialized,

    #[error("Initialization failed: {0}")]
    InitFailed(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("No event available")]
    NoEventAvailable,

    #[error("Not running")]
    NotRunning,

    #[error("Operation not allowed: {0}")]
    NotAllowed(String),

    #[error("Already in use: {0}")]
    AlreadyInUse(String),

    #[error("Nothing removed - entry not present")]
    NothingRemoved,

    #[error("Wrong state: {0}")]
    WrongState(String),

    #[error("Source is already connected to this sink")]
    SourceAlreadyConnected,

    #[error("Sink input is already connected")]
    SinkAlreadyConnected,

    #[error("Ring buffer error: {0}")]
    RingBuffer(#[from] RingBufferError),

    #[error("DSP error: {0}")]
    Dsp(#[from] xbar_dsp::DspError),

    #[error("Platform error: {0}")]
    Platform(#[from] xbar_platform::PlatformError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Fatal error: {0}")]
    Fatal(String),
}

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::InvalidParam("period size 0".into());
        assert!(err.to_string().contains("period size 0"));

        let err = CoreError::RingBuffer(RingBufferError::Timeout);
        assert!(err.to_string().contains("Timed out"));
    }

    #[test]
    fn test_from_dsp_error() {
        let dsp = xbar_dsp::DspError::RampNotSet;
        let core: CoreError = dsp.into();
        assert!(matches!(core, CoreError::Dsp(_)));
    }

    #[test]
    fn test_timeout_distinct_from_invalid_param() {
        assert_ne!(
            RingBufferError::Timeout,
            RingBufferError::InvalidParam("x".into())
        );
    }
}
