//! Server Error Types

use thiserror::Error;

/// Errors in the control-plane socket layer
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call failed: {0}")]
    Os(#[from] nix::errno::Errno),

    #[error("Message body too short")]
    ShortMessage,

    #[error("Unknown message id {0}")]
    UnknownMessage(u32),

    #[error("Bad message field: {0}")]
    BadField(String),

    #[error("Engine error: {0}")]
    Engine(#[from] tern_core::EngineError),
}

/// Result type alias for server operations
pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert!(ServerError::UnknownMessage(99).to_string().contains("99"));
        assert!(ServerError::ShortMessage.to_string().contains("short"));
    }
}
