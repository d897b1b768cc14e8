//! Error handling for the COSMIC Connect protocol
//!
//! This module provides a single error type for all protocol operations.
//! Errors are automatically converted from underlying library errors using
//! `thiserror`.
//!
//! ## Error Categories
//!
//! ### Framing Errors
//! `MalformedFrame`, `FrameTooLarge` and `InvalidType` are raised by the
//! packet codec. They close the link that produced them; the offending
//! frame is never retried.
//!
//! ### Handshake Errors
//! `Tls` and `PeerIdentityMismatch` are raised while establishing or
//! validating an encrypted session. An identity mismatch marks the peer
//! suspect and is not retried without operator intervention.
//!
//! ### Pairing Errors
//! `PairingTimeout`, `PairingRejected` and `NotPaired` surface the pair
//! state machine outcomes to device observers.
//!
//! ### Payload Errors
//! `PayloadFailed` covers size underruns/overruns and side-channel
//! failures; the link itself stays usable.
//!
//! ## Error Matching
//!
//! ```rust
//! use cosmic_connect_protocol::ProtocolError;
//!
//! let error = ProtocolError::DeviceNotFound("unknown-device".to_string());
//! assert_eq!(error.to_string(), "Device not found: unknown-device");
//!
//! let error = ProtocolError::NotPaired;
//! assert!(error.requires_user_action());
//! ```

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during protocol operations
///
/// Most variants convert automatically from underlying library errors
/// via the `From` trait:
/// - `std::io::Error` → `ProtocolError::Io`
/// - `serde_json::Error` → `ProtocolError::Json`
/// - `rustls::Error` → `ProtocolError::Tls`
/// - `rcgen::Error` → `ProtocolError::Certificate`
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (file system, network, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS error (secure connections, handshake failures)
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Certificate generation error
    #[error("Certificate error: {0}")]
    Certificate(#[from] rcgen::Error),

    /// Certificate parsing or validation error
    #[error("Certificate validation error: {0}")]
    CertificateValidation(String),

    /// A frame failed to parse as a protocol packet
    ///
    /// The frame is discarded and the link that produced it is closed.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// A frame exceeded the configured maximum length
    ///
    /// Oversized frames are an error, never silently truncated.
    #[error("Frame too large: {actual} bytes (max: {max})")]
    FrameTooLarge { actual: usize, max: usize },

    /// A packet carried an empty or unusable `type` field
    #[error("Invalid packet type: {0}")]
    InvalidType(String),

    /// A packet violated a structural invariant other than its type
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// The certificate presented on an encrypted session does not match
    /// the certificate stored for that peer
    ///
    /// The link is closed and the stored trust is marked suspect; the
    /// peer is not retried until the operator clears trust.
    #[error("Peer identity mismatch for device {0}")]
    PeerIdentityMismatch(String),

    /// Device not found in the registry
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Operation requires a paired device
    #[error("Not paired")]
    NotPaired,

    /// The peer rejected our pairing request
    #[error("Pairing rejected by peer")]
    PairingRejected,

    /// A pairing request deadline expired
    #[error("Pairing timed out after {0} seconds")]
    PairingTimeout(u64),

    /// The pair state machine received an operation invalid in its
    /// current state
    #[error("Invalid pairing state: {0}")]
    PairingState(String),

    /// All links to a device refused an outbound packet
    #[error("No usable link to device {0}")]
    NoLinkAvailable(String),

    /// A payload transfer failed (size mismatch, side-channel error)
    ///
    /// Partial output has been removed; the link remains usable.
    #[error("Payload transfer failed: {0}")]
    PayloadFailed(String),

    /// A network operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// An operation was cancelled (link closed, shutdown)
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Configuration is invalid or the persistent store is unusable
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Plugin-specific error
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// Discovery or connection acceptance suppressed by the
    /// trusted-network policy
    #[error("Blocked by network policy: {0}")]
    NetworkPolicy(String),
}

impl ProtocolError {
    /// Convert a generic I/O error into a more specific variant where the
    /// error kind allows it
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(format!("{}: {}", context, error)),
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                ProtocolError::Cancelled(format!("{}: connection interrupted ({})", context, error))
            }
            _ => ProtocolError::Io(error),
        }
    }

    /// Check if this error is transient and the operation can be retried
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Timeout(_)
                | ProtocolError::Io(_)
                | ProtocolError::NoLinkAvailable(_)
                | ProtocolError::PayloadFailed(_)
        )
    }

    /// Check if this error cannot be resolved without user intervention
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            ProtocolError::NotPaired
                | ProtocolError::PairingRejected
                | ProtocolError::PeerIdentityMismatch(_)
                | ProtocolError::CertificateValidation(_)
                | ProtocolError::Configuration(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ProtocolError::DeviceNotFound("test-device".to_string());
        assert_eq!(error.to_string(), "Device not found: test-device");

        let error = ProtocolError::NotPaired;
        assert_eq!(error.to_string(), "Not paired");

        let error = ProtocolError::FrameTooLarge {
            actual: 2048,
            max: 1024,
        };
        assert_eq!(error.to_string(), "Frame too large: 2048 bytes (max: 1024)");
    }

    #[test]
    fn test_io_error_conversion() {
        use std::io::{Error, ErrorKind};

        let io_error = Error::new(ErrorKind::NotFound, "file not found");
        let protocol_error: ProtocolError = io_error.into();

        assert!(matches!(protocol_error, ProtocolError::Io(_)));
        assert!(protocol_error.to_string().contains("file not found"));
    }

    #[test]
    fn test_io_error_refinement() {
        use std::io::{Error, ErrorKind};

        let timeout = Error::new(ErrorKind::TimedOut, "slow peer");
        let error = ProtocolError::from_io_error(timeout, "connecting");
        assert!(matches!(error, ProtocolError::Timeout(_)));
        assert!(error.is_recoverable());
    }

    #[test]
    fn test_user_action_classification() {
        assert!(ProtocolError::PeerIdentityMismatch("dev".into()).requires_user_action());
        assert!(!ProtocolError::Timeout("read".into()).requires_user_action());
        assert!(!ProtocolError::PeerIdentityMismatch("dev".into()).is_recoverable());
    }
}
