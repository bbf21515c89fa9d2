//! Engine Error Types

use thiserror::Error;

use crate::stream::StreamId;

/// Errors that can occur in the audio engine and stream transport
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid stream parameters: {0}")]
    InvalidStream(String),

    #[error("Stream {0:?} not found")]
    StreamNotFound(StreamId),

    #[error("Device {0} not found")]
    DeviceNotFound(u32),

    #[error("Device is not open")]
    DeviceNotOpen,

    #[error("No format satisfies the device and its streams")]
    FormatNegotiationFailed,

    #[error("Shared memory ring: {0}")]
    Shm(String),

    #[error("Backend error: {0}")]
    Backend(#[from] tern_platform::PlatformError),

    #[error("DSP error: {0}")]
    Dsp(#[from] tern_dsp::DspError),

    #[error("System call failed: {0}")]
    Os(#[from] nix::errno::Errno),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel send error - engine thread gone")]
    ChannelSend,

    #[error("Drain timed out")]
    DrainTimeout,
}

impl EngineError {
    /// True when the underlying backend error can be healed in place
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EngineError::Backend(e) if e.is_recoverable())
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
