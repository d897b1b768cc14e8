//! Ping Plugin
//!
//! Connectivity testing: send and receive `kdeconnect.ping` packets.
//!
//! ## Packet Format
//!
//! ```json
//! {
//!     "id": 1234567890,
//!     "type": "kdeconnect.ping",
//!     "body": {
//!         "message": "Optional message"
//!     }
//! }
//! ```
//!
//! The `message` field is optional. No reply is mandated by the
//! protocol; pings are fire-and-forget.

use super::{DeviceHandle, Plugin, PluginDescriptor};
use crate::payload::Payload;
use crate::{Packet, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

pub static DESCRIPTOR: PluginDescriptor = PluginDescriptor {
    key: "ping",
    display_name: "Ping",
    description: "Send and receive pings to test connectivity",
    incoming: &["kdeconnect.ping"],
    outgoing: &["kdeconnect.ping"],
    enabled_by_default: true,
    listen_to_unpaired: true,
    permissions: &[],
};

/// Ping plugin instance
#[derive(Debug, Default)]
pub struct PingPlugin {
    pings_received: u64,
    pings_sent: u64,
    /// Message of the most recent ping, for observers
    last_message: Option<String>,
}

impl PingPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pings_received(&self) -> u64 {
        self.pings_received
    }

    pub fn last_message(&self) -> Option<&str> {
        self.last_message.as_deref()
    }

    /// Build a ping packet, optionally with a message
    pub fn create_ping(message: Option<&str>) -> Packet {
        match message {
            Some(message) => Packet::new("kdeconnect.ping", json!({ "message": message })),
            None => Packet::new("kdeconnect.ping", json!({})),
        }
    }

    /// Send a ping to the device
    pub fn send_ping(&mut self, device: &DeviceHandle, message: Option<&str>) -> Result<()> {
        device.send_packet(Self::create_ping(message))?;
        self.pings_sent += 1;
        debug!(device_id = %device.device_id(), "Ping sent");
        Ok(())
    }
}

#[async_trait]
impl Plugin for PingPlugin {
    fn descriptor(&self) -> &'static PluginDescriptor {
        &DESCRIPTOR
    }

    async fn create(&mut self, device: &DeviceHandle) -> Result<()> {
        debug!(device_id = %device.device_id(), "Ping plugin ready");
        Ok(())
    }

    async fn handle_packet(
        &mut self,
        packet: &Packet,
        _payload: Option<Payload>,
        device: &DeviceHandle,
    ) -> Result<bool> {
        if !packet.is_type("kdeconnect.ping") {
            return Ok(false);
        }

        self.pings_received += 1;
        self.last_message = packet.get_body_field::<String>("message");

        match &self.last_message {
            Some(message) => info!(
                device_name = %device.device_name(),
                message = %message,
                "Ping received"
            ),
            None => info!(device_name = %device.device_name(), "Ping received"),
        }

        Ok(true)
    }

    async fn destroy(&mut self) {
        debug!("Ping plugin destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::OutboundPacket;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn handle() -> (
        DeviceHandle,
        mpsc::UnboundedReceiver<(String, OutboundPacket)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            DeviceHandle::new(
                "peer".into(),
                "Peer".into(),
                Arc::new(AtomicBool::new(true)),
                tx,
            ),
            rx,
        )
    }

    #[test]
    fn test_create_ping() {
        let packet = PingPlugin::create_ping(Some("hello"));
        assert!(packet.is_type("kdeconnect.ping"));
        assert_eq!(
            packet.get_body_field::<String>("message"),
            Some("hello".to_string())
        );

        let bare = PingPlugin::create_ping(None);
        assert!(bare.get_body_field::<String>("message").is_none());
    }

    #[tokio::test]
    async fn test_handle_ping() {
        let (device, _rx) = handle();
        let mut plugin = PingPlugin::new();

        let packet = Packet::with_id(12345, "kdeconnect.ping", json!({"message": "hello"}));
        let handled = plugin.handle_packet(&packet, None, &device).await.unwrap();

        assert!(handled);
        assert_eq!(plugin.pings_received(), 1);
        assert_eq!(plugin.last_message(), Some("hello"));
    }

    #[tokio::test]
    async fn test_send_ping_queues_packet() {
        let (device, mut rx) = handle();
        let mut plugin = PingPlugin::new();

        plugin.send_ping(&device, None).unwrap();

        let (device_id, outbound) = rx.recv().await.unwrap();
        assert_eq!(device_id, "peer");
        assert!(matches!(outbound, OutboundPacket::Plain(p) if p.is_type("kdeconnect.ping")));
    }
}
