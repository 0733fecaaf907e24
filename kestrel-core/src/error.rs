//! Kestrel error types.
//!
//! Comprehensive error handling for server setup and operation.

use std::io;
use thiserror::Error;

/// Main error type for server-wide (setup-time) failures.
///
/// Per-connection and per-call failures are *not* routed through this type:
/// they use the `-1`/`bool` return conventions their callbacks specify, so
/// that no error ever propagates across a connection boundary (see the
/// error handling design notes in the crate README).
#[derive(Error, Debug)]
pub enum ServerError {
    /// IO error during socket setup or reactor operation.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The reactor (`mio::Poll`) could not be created or configured.
    #[error("failed to initialize reactor: {0}")]
    ReactorInit(io::Error),

    /// `fork()` failed while spawning an additional worker process.
    #[error("fork failed: {0}")]
    Fork(io::Error),

    /// No default protocol was supplied in `ServerSettings`.
    #[error("server settings are missing a default protocol")]
    MissingProtocol,
}

/// Result type alias for server-wide operations.
pub type ServerResult<T> = std::result::Result<T, ServerError>;

impl ServerError {
    /// Returns true if this error reflects a transient condition that could
    /// plausibly succeed on retry (as opposed to a fatal misconfiguration).
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            Self::Bind { .. } | Self::ReactorInit(_) | Self::Fork(_) | Self::MissingProtocol => {
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_errors_are_not_recoverable() {
        let err = ServerError::Bind {
            addr: "0.0.0.0:8080".into(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert!(!err.is_recoverable());
    }

    #[test]
    fn interrupted_io_is_recoverable() {
        let err = ServerError::Io(io::Error::from(io::ErrorKind::Interrupted));
        assert!(err.is_recoverable());
    }
}
