//! Platform Error Types

use thiserror::Error;

/// Errors surfaced by hardware backends and config loaders.
///
/// The engine cares about one distinction above all: recoverable backend
/// errors (xrun, suspend) self-heal inside the service cycle, everything
/// else removes the device. [`PlatformError::is_recoverable`] encodes that
/// split.
#[derive(Error, Debug)]
pub enum PlatformError {
    #[cfg(target_os = "linux")]
    #[error("ALSA error: {0}")]
    Alsa(#[from] alsa::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device is not configured")]
    NotConfigured,

    #[error("Unsupported format for this backend: {0}")]
    UnsupportedFormat(String),

    #[error("Bluetooth transport closed")]
    TransportClosed,

    #[error("Config parse error at line {line}: {reason}")]
    ConfigParse { line: usize, reason: String },

    #[error("DSP error: {0}")]
    Dsp(#[from] tern_dsp::DspError),
}

impl PlatformError {
    /// True for errors the backend can recover from in place (EPIPE xrun,
    /// ESTRPIPE suspend). Everything else is device-fatal.
    pub fn is_recoverable(&self) -> bool {
        match self {
            #[cfg(target_os = "linux")]
            PlatformError::Alsa(e) => {
                let errno = e.errno();
                errno == libc::EPIPE || errno == libc::ESTRPIPE
            }
            PlatformError::Io(e) => {
                matches!(e.raw_os_error(), Some(libc::EPIPE) | Some(libc::ESTRPIPE))
            }
            _ => false,
        }
    }
}

/// Result type alias for platform operations
pub type PlatformResult<T> = Result<T, PlatformError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_epipe_is_recoverable() {
        let err = PlatformError::Io(std::io::Error::from_raw_os_error(libc::EPIPE));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_other_errors_are_fatal() {
        assert!(!PlatformError::NotConfigured.is_recoverable());
        let err = PlatformError::Io(std::io::Error::from_raw_os_error(libc::ENODEV));
        assert!(!err.is_recoverable());
    }
}
