//! DSP Error Types

use thiserror::Error;

/// Errors that can occur during format conversion and mixing
#[derive(Error, Debug)]
pub enum DspError {
    #[error("Invalid channel count: {0}")]
    InvalidChannelCount(usize),

    #[error("Channel layout does not describe {0} channels")]
    LayoutMismatch(usize),

    #[error("Unsupported sample rate: {0}")]
    UnsupportedRate(u32),

    #[error("Buffer of {got} samples is too small, need {need}")]
    BufferTooSmall { need: usize, got: usize },

    #[error("Invalid volume curve: {0}")]
    InvalidCurve(String),
}

/// Result type alias for DSP operations
pub type DspResult<T> = Result<T, DspError>;
