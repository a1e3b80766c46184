//! Error types for IPSec transform operations
//!
//! This module defines a unified error type for the transform engine,
//! covering the packet path (AH/ESP processing, policy checks) and the
//! control plane (SA/policy installation, transform registration).

use std::fmt;

/// Result type for IPSec operations
pub type Result<T> = std::result::Result<T, Error>;

/// IPSec transform engine errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The AH/ESP treatment of a packet does not match its policy
    PolicyMismatch(String),

    /// The matching policy discards this traffic
    PolicyDrop(String),

    /// Security Association not found (or no longer usable)
    SaNotFound(String),

    /// Integrity check value did not verify
    AuthenticationFailed(String),

    /// Replay attack detected
    ReplayDetected(u32),

    /// Decrypted data is inconsistent with its framing
    MalformedCiphertext(String),

    /// Key length not in the transform's key-size mask
    InvalidKeyLength {
        /// Transform name
        algorithm: String,
        /// Offered key length in bytes
        actual: usize,
    },

    /// No transform registered (or discoverable) under this name
    TransformNotFound(String),

    /// A transform with this name is already registered
    TransformExists(String),

    /// Transform is still referenced by a live context
    TransformBusy(String),

    /// An SA with this identity is already installed
    DuplicateSa(String),

    /// A policy with this selector is already installed
    DuplicatePolicy(String),

    /// Outbound sequence number space exhausted
    SequenceOverflow(u32),

    /// Packet headers are malformed or unsupported
    InvalidPacket(String),

    /// Invalid packet length
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Buffer too short for operation
    BufferTooShort {
        /// Required length
        required: usize,
        /// Available length
        available: usize,
    },

    /// Invalid Security Parameter Index
    InvalidSpi(u32),

    /// Invalid configuration parameter
    InvalidParameter(String),

    /// State machine error
    InvalidState(String),

    /// Cryptographic operation failed
    CryptoError(String),

    /// Internal error (should not happen)
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::PolicyMismatch(msg) => write!(f, "Policy mismatch: {}", msg),
            Error::PolicyDrop(msg) => write!(f, "Dropped by policy: {}", msg),
            Error::SaNotFound(id) => write!(f, "Security Association not found: {}", id),
            Error::AuthenticationFailed(msg) => {
                write!(f, "Authentication failed: {}", msg)
            }
            Error::ReplayDetected(seq) => {
                write!(f, "Replay attack detected (sequence: {})", seq)
            }
            Error::MalformedCiphertext(msg) => write!(f, "Malformed ciphertext: {}", msg),
            Error::InvalidKeyLength { algorithm, actual } => {
                write!(f, "Invalid key length for {}: {} bytes", algorithm, actual)
            }
            Error::TransformNotFound(name) => write!(f, "Transform not found: {}", name),
            Error::TransformExists(name) => {
                write!(f, "Transform already registered: {}", name)
            }
            Error::TransformBusy(name) => write!(f, "Transform still in use: {}", name),
            Error::DuplicateSa(id) => write!(f, "Security Association already exists: {}", id),
            Error::DuplicatePolicy(sel) => write!(f, "Policy already exists: {}", sel),
            Error::SequenceOverflow(seq) => {
                write!(f, "Sequence number overflow at {} - SA must be replaced", seq)
            }
            Error::InvalidPacket(msg) => write!(f, "Invalid packet: {}", msg),
            Error::InvalidLength { expected, actual } => {
                write!(
                    f,
                    "Invalid length: expected {}, got {}",
                    expected, actual
                )
            }
            Error::BufferTooShort {
                required,
                available,
            } => {
                write!(
                    f,
                    "Buffer too short: need {} bytes, have {}",
                    required, available
                )
            }
            Error::InvalidSpi(spi) => write!(f, "Invalid SPI: 0x{:08x}", spi),
            Error::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<Error> for kestrel_platform::KestrelError {
    fn from(err: Error) -> Self {
        use kestrel_platform::KestrelError;

        match err {
            Error::InvalidParameter(_)
            | Error::InvalidKeyLength { .. }
            | Error::TransformNotFound(_)
            | Error::TransformExists(_)
            | Error::DuplicateSa(_)
            | Error::DuplicatePolicy(_) => KestrelError::Config(err.to_string()),
            Error::InvalidState(_) | Error::TransformBusy(_) => {
                KestrelError::State(err.to_string())
            }
            Error::AuthenticationFailed(_)
            | Error::ReplayDetected(_)
            | Error::PolicyMismatch(_)
            | Error::PolicyDrop(_) => KestrelError::Security(err.to_string()),
            other => KestrelError::Protocol(other.to_string()),
        }
    }
}
