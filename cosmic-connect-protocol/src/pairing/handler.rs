//! Pair state machine
//!
//! One handler exists per (local, peer) pair and owns that pair's
//! protocol state. The handler is pure state: it decides transitions
//! and hands the caller the packets to send and the trust changes to
//! apply; the connection manager performs the I/O and the key store
//! writes.
//!
//! ## States and transitions
//!
//! ```text
//! unpaired ──local request──────▶ request-sent (deadline = now + T)
//! unpaired ──receive pair{true}─▶ request-received (deadline = now + T)
//! request-sent ──pair{true}─────▶ paired                // peer accepted
//! request-sent ──pair{false}────▶ unpaired              // peer rejected
//! request-sent ──deadline───────▶ unpaired (timeout)
//! request-received ──accept─────▶ paired (send pair{true})
//! request-received ──reject─────▶ unpaired (send pair{false})
//! request-received ──deadline───▶ unpaired
//! paired ──receive pair{false}──▶ unpaired-remotely
//! paired ──local unpair─────────▶ unpaired (send pair{false})
//! ```
//!
//! A local request while a request from that same peer is pending takes
//! the accept path instead of sending a second request.

use crate::{Packet, ProtocolError, Result};
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default pairing deadline
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(30);

/// Pair protocol state for one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    /// No pairing exists
    Unpaired,
    /// We sent a request and await the answer
    RequestSent { deadline: Instant },
    /// The peer sent a request and awaits our answer
    RequestReceived { deadline: Instant },
    /// Mutually trusted
    Paired,
    /// The peer unpaired us; locally equivalent to `Unpaired` but
    /// distinguishable for observers
    UnpairedRemotely,
}

impl PairState {
    pub fn is_paired(&self) -> bool {
        matches!(self, PairState::Paired)
    }

    fn can_request(&self) -> bool {
        matches!(self, PairState::Unpaired | PairState::UnpairedRemotely)
    }
}

/// Pairing request/response packet body `{pair: bool}`
#[derive(Debug, Clone)]
pub struct PairingPacket {
    pub pair: bool,
}

impl PairingPacket {
    pub fn request() -> Packet {
        Packet::new("kdeconnect.pair", json!({ "pair": true }))
    }

    pub fn accept() -> Packet {
        Packet::new("kdeconnect.pair", json!({ "pair": true }))
    }

    pub fn reject() -> Packet {
        Packet::new("kdeconnect.pair", json!({ "pair": false }))
    }

    pub fn unpair() -> Packet {
        Packet::new("kdeconnect.pair", json!({ "pair": false }))
    }

    pub fn from_packet(packet: &Packet) -> Result<Self> {
        if !packet.is_type("kdeconnect.pair") {
            return Err(ProtocolError::InvalidPacket(
                "not a pairing packet".to_string(),
            ));
        }

        let pair = packet
            .get_body_field::<bool>("pair")
            .ok_or_else(|| ProtocolError::InvalidPacket("missing pair field".to_string()))?;

        Ok(Self { pair })
    }
}

/// What a local pairing request resolved to
#[derive(Debug)]
pub enum RequestOutcome {
    /// A request went out; send the packet and arm the deadline
    Sent { packet: Packet, deadline: Instant },
    /// The peer already asked; this is an accept (send the packet,
    /// store trust)
    AcceptedPending { packet: Packet },
}

/// Effect of an incoming pair packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairTransition {
    /// `pair{true}` from an unpaired peer: a request is now pending on
    /// our side, deadline armed
    RequestReceived { deadline: Instant },
    /// `pair{true}` answering our request: now paired; store trust
    PeerAccepted,
    /// `pair{true}` while already paired: re-acknowledge
    AlreadyPaired,
    /// `pair{true}` while the peer's request is already pending
    DuplicateRequest,
    /// `pair{false}` answering our request
    PeerRejected,
    /// `pair{false}` from a paired peer: remote unpair; revoke trust
    PeerUnpaired,
    /// `pair{false}` with nothing pending
    NoEffect,
}

/// Per-peer pair state machine
#[derive(Debug)]
pub struct PairingHandler {
    device_id: String,
    state: PairState,
    timeout: Duration,
    /// Bumped on every transition so an expired timer armed for an
    /// earlier state cannot fire into a newer one
    generation: u64,
}

impl PairingHandler {
    pub fn new(device_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            device_id: device_id.into(),
            state: PairState::Unpaired,
            timeout,
            generation: 0,
        }
    }

    /// Restore the paired state from persisted trust
    pub fn new_paired(device_id: impl Into<String>, timeout: Duration) -> Self {
        let mut handler = Self::new(device_id, timeout);
        handler.state = PairState::Paired;
        handler
    }

    pub fn state(&self) -> PairState {
        self.state
    }

    pub fn is_paired(&self) -> bool {
        self.state.is_paired()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout.as_secs()
    }

    fn transition(&mut self, state: PairState) {
        debug!(
            device_id = %self.device_id,
            from = ?self.state,
            to = ?state,
            "Pair state transition"
        );
        self.state = state;
        self.generation += 1;
    }

    /// Local pairing request
    pub fn request(&mut self, now: Instant) -> Result<RequestOutcome> {
        match self.state {
            // A pending request from this peer is answered, not raced.
            PairState::RequestReceived { .. } => {
                self.transition(PairState::Paired);
                Ok(RequestOutcome::AcceptedPending {
                    packet: PairingPacket::accept(),
                })
            }
            state if state.can_request() => {
                let deadline = now + self.timeout;
                self.transition(PairState::RequestSent { deadline });
                Ok(RequestOutcome::Sent {
                    packet: PairingPacket::request(),
                    deadline,
                })
            }
            PairState::Paired => Err(ProtocolError::PairingState(
                "already paired".to_string(),
            )),
            PairState::RequestSent { .. } => Err(ProtocolError::PairingState(
                "request already pending".to_string(),
            )),
            _ => unreachable!(),
        }
    }

    /// Local accept of a pending peer request
    pub fn accept(&mut self) -> Result<Packet> {
        match self.state {
            PairState::RequestReceived { .. } => {
                self.transition(PairState::Paired);
                Ok(PairingPacket::accept())
            }
            _ => Err(ProtocolError::PairingState(
                "no pairing request pending".to_string(),
            )),
        }
    }

    /// Local reject of a pending peer request
    pub fn reject(&mut self) -> Result<Packet> {
        match self.state {
            PairState::RequestReceived { .. } => {
                self.transition(PairState::Unpaired);
                Ok(PairingPacket::reject())
            }
            _ => Err(ProtocolError::PairingState(
                "no pairing request pending".to_string(),
            )),
        }
    }

    /// Local unpair; valid in any state, always lands in `Unpaired`
    pub fn unpair(&mut self) -> Packet {
        self.transition(PairState::Unpaired);
        PairingPacket::unpair()
    }

    /// Incoming pair packet
    pub fn handle_packet(&mut self, pair: bool, now: Instant) -> PairTransition {
        if pair {
            match self.state {
                PairState::Unpaired | PairState::UnpairedRemotely => {
                    let deadline = now + self.timeout;
                    self.transition(PairState::RequestReceived { deadline });
                    PairTransition::RequestReceived { deadline }
                }
                PairState::RequestSent { .. } => {
                    self.transition(PairState::Paired);
                    PairTransition::PeerAccepted
                }
                PairState::RequestReceived { .. } => PairTransition::DuplicateRequest,
                PairState::Paired => PairTransition::AlreadyPaired,
            }
        } else {
            match self.state {
                PairState::RequestSent { .. } => {
                    self.transition(PairState::Unpaired);
                    PairTransition::PeerRejected
                }
                PairState::Paired => {
                    self.transition(PairState::UnpairedRemotely);
                    PairTransition::PeerUnpaired
                }
                PairState::RequestReceived { .. } => {
                    self.transition(PairState::Unpaired);
                    PairTransition::NoEffect
                }
                _ => PairTransition::NoEffect,
            }
        }
    }

    /// Check an armed deadline; returns true when the state machine
    /// fell back to `Unpaired` because of it
    ///
    /// `generation` is the value captured when the timer was armed; a
    /// stale timer is ignored.
    pub fn deadline_expired(&mut self, generation: u64, now: Instant) -> bool {
        if generation != self.generation {
            return false;
        }

        match self.state {
            PairState::RequestSent { deadline } | PairState::RequestReceived { deadline }
                if now >= deadline =>
            {
                self.transition(PairState::Unpaired);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> PairingHandler {
        PairingHandler::new("peer_1", PAIRING_TIMEOUT)
    }

    #[test]
    fn test_pairing_packet_parsing() {
        let parsed = PairingPacket::from_packet(&PairingPacket::request()).unwrap();
        assert!(parsed.pair);

        let parsed = PairingPacket::from_packet(&PairingPacket::reject()).unwrap();
        assert!(!parsed.pair);

        let not_pair = Packet::new("kdeconnect.ping", json!({}));
        assert!(PairingPacket::from_packet(&not_pair).is_err());
    }

    #[test]
    fn test_request_then_peer_accept() {
        let mut h = handler();
        let now = Instant::now();

        let outcome = h.request(now).unwrap();
        assert!(matches!(outcome, RequestOutcome::Sent { .. }));
        assert!(matches!(h.state(), PairState::RequestSent { .. }));

        let transition = h.handle_packet(true, now);
        assert_eq!(transition, PairTransition::PeerAccepted);
        assert!(h.is_paired());
    }

    #[test]
    fn test_request_then_peer_reject() {
        let mut h = handler();
        let now = Instant::now();

        h.request(now).unwrap();
        let transition = h.handle_packet(false, now);
        assert_eq!(transition, PairTransition::PeerRejected);
        assert_eq!(h.state(), PairState::Unpaired);
    }

    #[test]
    fn test_incoming_request_then_local_accept() {
        let mut h = handler();
        let now = Instant::now();

        let transition = h.handle_packet(true, now);
        assert!(matches!(transition, PairTransition::RequestReceived { .. }));

        h.accept().unwrap();
        assert!(h.is_paired());
    }

    #[test]
    fn test_incoming_request_then_local_reject() {
        let mut h = handler();
        let now = Instant::now();

        h.handle_packet(true, now);
        h.reject().unwrap();
        assert_eq!(h.state(), PairState::Unpaired);
    }

    #[test]
    fn test_request_while_peer_request_pending_accepts() {
        let mut h = handler();
        let now = Instant::now();

        h.handle_packet(true, now);
        let outcome = h.request(now).unwrap();
        assert!(matches!(outcome, RequestOutcome::AcceptedPending { .. }));
        assert!(h.is_paired());
    }

    #[test]
    fn test_remote_unpair() {
        let mut h = PairingHandler::new_paired("peer_1", PAIRING_TIMEOUT);
        assert!(h.is_paired());

        let transition = h.handle_packet(false, Instant::now());
        assert_eq!(transition, PairTransition::PeerUnpaired);
        assert_eq!(h.state(), PairState::UnpairedRemotely);

        // A remote unpair does not block a fresh local request.
        assert!(matches!(
            h.request(Instant::now()).unwrap(),
            RequestOutcome::Sent { .. }
        ));
    }

    #[test]
    fn test_deadline_expiry() {
        let mut h = handler();
        let now = Instant::now();

        h.request(now).unwrap();
        let generation = h.generation();

        // Not yet expired.
        assert!(!h.deadline_expired(generation, now));

        let late = now + PAIRING_TIMEOUT + Duration::from_secs(1);
        assert!(h.deadline_expired(generation, late));
        assert_eq!(h.state(), PairState::Unpaired);
    }

    #[test]
    fn test_stale_deadline_ignored() {
        let mut h = handler();
        let now = Instant::now();

        h.request(now).unwrap();
        let stale_generation = h.generation();

        // The peer answers before the timer fires.
        h.handle_packet(true, now);
        assert!(h.is_paired());

        let late = now + PAIRING_TIMEOUT + Duration::from_secs(1);
        assert!(!h.deadline_expired(stale_generation, late));
        assert!(h.is_paired());
    }

    #[test]
    fn test_cannot_double_request() {
        let mut h = handler();
        let now = Instant::now();

        h.request(now).unwrap();
        assert!(h.request(now).is_err());
    }

    #[test]
    fn test_accept_requires_pending_request() {
        let mut h = handler();
        assert!(h.accept().is_err());
        assert!(h.reject().is_err());
    }

    #[test]
    fn test_duplicate_peer_request() {
        let mut h = handler();
        let now = Instant::now();

        h.handle_packet(true, now);
        assert_eq!(h.handle_packet(true, now), PairTransition::DuplicateRequest);
    }
}
