//! Transport Links
//!
//! A link is one duplex, encrypted byte stream to one peer over one
//! medium. Links are produced by link providers (the LAN provider lives
//! in [`lan`]), owned by the provider that produced them, and
//! multiplexed per device by the connection manager: a device reachable
//! over several media holds several links, and outbound traffic prefers
//! the highest-priority link that is ready.
//!
//! Providers report lifecycle and traffic through a shared
//! [`LinkEvent`] channel consumed by the connection manager's
//! dispatcher task, which keeps all registry and pair-state mutations
//! on one execution context.

pub mod lan;

use crate::discovery::DeviceInfo;
use crate::payload::{Payload, PayloadSource};
use crate::{Packet, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-unique link identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(u64);

impl LinkId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Transport medium of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMedium {
    /// TLS over TCP on the local network
    Lan,
}

impl LinkMedium {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkMedium::Lan => "lan",
        }
    }
}

/// Lifecycle state of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Socket open, identity not yet exchanged
    Connecting,
    /// Identity exchanged and TLS established
    Identified,
    /// Pair negotiation in flight on this link
    Pairing,
    /// Fully usable for plugin traffic
    Ready,
    Closing,
    Closed,
}

impl LinkState {
    pub fn is_usable(&self) -> bool {
        matches!(self, LinkState::Identified | LinkState::Pairing | LinkState::Ready)
    }
}

/// Events emitted by link providers
#[derive(Debug)]
pub enum LinkEvent {
    /// A link completed the setup sequence: identity exchanged, TLS
    /// established, peer certificate validated
    Identified {
        link: Arc<dyn DeviceLink>,
        info: DeviceInfo,
        /// DER certificate the peer presented during the handshake
        certificate: Vec<u8>,
        /// Lowercase hex SHA-256 of `certificate`
        fingerprint: String,
    },

    /// A packet arrived on a link
    ///
    /// When the packet declared a payload, the side-channel has already
    /// been connected and is attached here.
    PacketReceived {
        link_id: LinkId,
        device_id: String,
        packet: Packet,
        payload: Option<Payload>,
    },

    /// A link left service
    Closed {
        link_id: LinkId,
        device_id: Option<String>,
        reason: String,
    },
}

/// One duplex encrypted stream to one peer over one medium
#[async_trait]
pub trait DeviceLink: Send + Sync + fmt::Debug {
    fn id(&self) -> LinkId;

    fn medium(&self) -> LinkMedium;

    /// Provider priority; the connection manager prefers higher values
    /// for outbound sends
    fn priority(&self) -> i32;

    /// Peer device id (known once the link is identified)
    fn device_id(&self) -> String;

    fn state(&self) -> LinkState;

    fn set_state(&self, state: LinkState);

    /// Encode and write one packet
    ///
    /// Writers on the same link are serialized; packets sent through
    /// one link arrive in submission order.
    async fn send_packet(&self, packet: &Packet) -> Result<()>;

    /// Send a packet that advertises a payload
    ///
    /// Allocates a dedicated listening port, rewrites the packet's
    /// `payloadTransferInfo`, sends the packet, then serves exactly one
    /// side-channel connection. With `wait` the call blocks until the
    /// receiver has drained the payload; otherwise serving continues in
    /// the background and is aborted if the link closes.
    async fn send_packet_with_payload(
        &self,
        packet: Packet,
        source: PayloadSource,
        wait: bool,
    ) -> Result<()>;

    /// Close the link, cancelling the receive loop and any in-flight
    /// payload transfers
    async fn close(&self, reason: &str);
}

/// A source of links (one per transport medium)
#[async_trait]
pub trait LinkProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Priority assigned to links from this provider
    fn priority(&self) -> i32;

    /// Open sockets and start producing links
    async fn start(self: Arc<Self>) -> Result<()>;

    /// Stop accepting and producing; existing links stay up until
    /// closed individually
    async fn stop(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_id_uniqueness() {
        let a = LinkId::next();
        let b = LinkId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_usable_states() {
        assert!(LinkState::Ready.is_usable());
        assert!(LinkState::Identified.is_usable());
        assert!(!LinkState::Closed.is_usable());
        assert!(!LinkState::Connecting.is_usable());
    }
}
