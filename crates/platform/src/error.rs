//! Error types for Kestrel

use std::fmt;

/// Unified error type for module lifecycle operations
#[derive(Debug)]
pub enum KestrelError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol error
    Protocol(String),

    /// Security error (authentication, key material, policy)
    Security(String),

    /// Operation not valid in the module's current state
    State(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for KestrelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KestrelError::Io(e) => write!(f, "IO error: {}", e),
            KestrelError::Config(msg) => write!(f, "Configuration error: {}", msg),
            KestrelError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            KestrelError::Security(msg) => write!(f, "Security error: {}", msg),
            KestrelError::State(msg) => write!(f, "Invalid module state: {}", msg),
            KestrelError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for KestrelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KestrelError::Io(e) => Some(e),
            KestrelError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KestrelError {
    fn from(err: std::io::Error) -> Self {
        KestrelError::Io(err)
    }
}

/// Result type for Kestrel operations
pub type KestrelResult<T> = Result<T, KestrelError>;
