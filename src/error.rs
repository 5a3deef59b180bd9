//! Error types and handling for the spool library

use thiserror::Error;

/// Result type alias for spool operations
pub type Result<T> = std::result::Result<T, SpoolError>;

/// Fatal error type for the spool library.
///
/// Per-peer conditions are not errors: a peer that would block or must be
/// dropped is reported through the outcome enums of the peer and worker
/// modules and recovered locally by the owning event loop. `SpoolError` is
/// reserved for conditions that terminate the process after a best-effort
/// flush.
#[derive(Error, Debug)]
pub enum SpoolError {
    /// I/O errors from socket and descriptor operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Ring buffer protocol errors (corrupt record, overflowed update queue)
    #[error("Ring error: {message}")]
    Ring {
        /// Error message describing the ring issue
        message: String,
    },

    /// Listening socket errors
    #[error("Socket error: {message}")]
    Socket {
        /// Error message describing the socket issue
        message: String,
    },

    /// TLS configuration or session setup errors
    #[error("TLS error: {message}")]
    Tls {
        /// Error message describing the TLS issue
        message: String,
    },

    /// CPU affinity errors
    #[error("CPU affinity error: {0}")]
    CpuAffinity(#[from] nix::Error),

    /// An application callback returned a fatal verdict
    #[error("Application {app} requested termination")]
    AppFatal {
        /// Index of the app whose callback failed
        app: usize,
    },

    /// Generic error for unexpected conditions.
    /// This error should be used for situations that are not expected to
    /// happen in a correctly functioning system, such as a logic error in
    /// the code.
    #[error("Unexpected error: {message}")]
    Unexpected {
        /// Error message describing the unexpected condition
        message: String,
    },
}

impl SpoolError {
    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a new ring protocol error
    pub fn ring(message: impl Into<String>) -> Self {
        Self::Ring {
            message: message.into(),
        }
    }

    /// Create a new socket error
    pub fn socket(message: impl Into<String>) -> Self {
        Self::Socket {
            message: message.into(),
        }
    }

    /// Create a new TLS error
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    /// Create a new unexpected error
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected {
            message: message.into(),
        }
    }

    /// Check if this error came from a misconfiguration rather than runtime state
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::InvalidConfig { .. } | Self::Tls { .. })
    }

    /// Check if this error is related to network operations
    pub fn is_network_error(&self) -> bool {
        matches!(self, Self::Socket { .. } | Self::Io(_))
    }
}

/// Convenience macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::error::SpoolError::config(format!($($arg)*))
    };
}

/// Convenience macro for creating ring protocol errors
#[macro_export]
macro_rules! ring_error {
    ($($arg:tt)*) => {
        $crate::error::SpoolError::ring(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = SpoolError::config("test message");
        assert!(matches!(err, SpoolError::InvalidConfig { .. }));
        assert!(err.is_config_error());
    }

    #[test]
    fn test_error_classification() {
        let sock = SpoolError::socket("bind failed");
        assert!(sock.is_network_error());
        assert!(!sock.is_config_error());

        let ring = SpoolError::ring("update queue overflow");
        assert!(!ring.is_network_error());
    }

    #[test]
    fn test_error_macros() {
        let err = config_error!("invalid value: {}", 42);
        assert!(matches!(err, SpoolError::InvalidConfig { .. }));

        let err = ring_error!("record truncated at {}", 7);
        assert!(matches!(err, SpoolError::Ring { .. }));
    }
}
