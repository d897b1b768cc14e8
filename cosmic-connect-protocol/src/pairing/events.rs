//! Pairing Event System
//!
//! Events emitted while the pair state machine runs. Consumers are the
//! daemon (notifications, pairing UI) and tests.

/// Events emitted by the pairing layer
#[derive(Debug, Clone)]
pub enum PairingEvent {
    /// We sent a pairing request to a device
    RequestSent {
        device_id: String,
        /// Our certificate fingerprint, for user verification
        our_fingerprint: String,
    },

    /// A device asked to pair with us
    RequestReceived {
        device_id: String,
        device_name: String,
        /// The requester's certificate fingerprint, for user verification
        their_fingerprint: String,
    },

    /// Pairing completed; the peer is now trusted
    Paired { device_id: String },

    /// A pairing request was rejected (by us or by the peer)
    Rejected {
        device_id: String,
        reason: Option<String>,
    },

    /// The pairing is gone; `by_peer` distinguishes a remote unpair
    /// from a local one
    Unpaired { device_id: String, by_peer: bool },

    /// A pairing request deadline expired with no answer
    Timeout { device_id: String },
}

impl PairingEvent {
    pub fn device_id(&self) -> &str {
        match self {
            PairingEvent::RequestSent { device_id, .. }
            | PairingEvent::RequestReceived { device_id, .. }
            | PairingEvent::Paired { device_id }
            | PairingEvent::Rejected { device_id, .. }
            | PairingEvent::Unpaired { device_id, .. }
            | PairingEvent::Timeout { device_id } => device_id,
        }
    }
}
