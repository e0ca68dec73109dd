//! DSP Error Types

use thiserror::Error;

/// Errors that can occur in the bundled DSP runtime
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DspError {
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Component used before initialization")]
    NotInitialized,

    #[error("Initialization failed: {0}")]
    InitFailed(String),

    #[error("Frame length {0} is not a multiple of {1}")]
    BadFrameLength(u32, u32),

    #[error("No free channels left in bundle (requested {requested}, free {free})")]
    NoSpaceLeft { requested: u32, free: u32 },

    #[error("Nothing removed - entry not present")]
    NothingRemoved,

    #[error("Ramp time must not be zero")]
    ZeroRampTime,

    #[error("Unknown ramp shape")]
    UnknownRampShape,

    #[error("Ramp not set - call set_timed_ramp first")]
    RampNotSet,

    #[error("Output buffer too short: expected {expected}, got {got}")]
    BufferSizeMismatch { expected: usize, got: usize },

    #[error("Unsupported format conversion: {0}")]
    UnsupportedFormat(String),

    #[error("Unknown stream id {0}")]
    UnknownStreamId(i32),

    #[error("Unknown module type '{0}'")]
    UnknownModuleType(String),

    #[error("Pin link would form a cycle without a delayed edge")]
    ImmediateCycle,

    #[error("Pin '{0}' is already linked")]
    AlreadyInUse(String),
}

/// Result type alias for DSP operations
pub type DspResult<T> = Result<T, DspError>;
