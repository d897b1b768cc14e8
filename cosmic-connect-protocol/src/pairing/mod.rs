//! Device Pairing
//!
//! TLS-based secure pairing between devices.
//!
//! ## Pairing Protocol
//!
//! 1. **Discovery**: devices find each other via UDP broadcast
//! 2. **Link setup**: identity exchange, then TLS with self-signed
//!    certificates
//! 3. **Pairing Request**: one side sends `kdeconnect.pair` with
//!    `pair: true`
//! 4. **User Verification**: users compare certificate fingerprints on
//!    both devices (the consent UI itself lives outside this crate)
//! 5. **Pairing Response**: `pair: true` (accept) or `pair: false`
//!    (reject) within the 30 second deadline
//! 6. **Trust**: on acceptance both sides store and pin the certificate
//!    captured at the TLS handshake (Trust-On-First-Use)
//!
//! Subsequent connections are validated against the pinned certificate;
//! a fingerprint change fails the handshake until trust is cleared.

pub mod events;
pub mod handler;

pub use events::PairingEvent;
pub use handler::{
    PairState, PairTransition, PairingHandler, PairingPacket, RequestOutcome, PAIRING_TIMEOUT,
};
