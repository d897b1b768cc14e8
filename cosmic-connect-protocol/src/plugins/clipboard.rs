//! Clipboard Plugin
//!
//! Relays clipboard content between devices.
//!
//! ## Packet Types
//!
//! - `kdeconnect.clipboard`: content changed, body `{content}`
//! - `kdeconnect.clipboard.connect`: content sent on connection, body
//!   `{content, timestamp}`; only applied when newer than what we hold
//!
//! Reading and writing the host clipboard is a platform integration and
//! lives outside this crate; the plugin tracks the latest remote
//! content and lets the embedder push local changes.

use super::{DeviceHandle, Plugin, PluginDescriptor};
use crate::packet::current_timestamp;
use crate::payload::Payload;
use crate::{Packet, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

pub static DESCRIPTOR: PluginDescriptor = PluginDescriptor {
    key: "clipboard",
    display_name: "Clipboard",
    description: "Synchronize clipboard content between devices",
    incoming: &["kdeconnect.clipboard", "kdeconnect.clipboard.connect"],
    outgoing: &["kdeconnect.clipboard", "kdeconnect.clipboard.connect"],
    enabled_by_default: true,
    listen_to_unpaired: false,
    permissions: &[],
};

/// Clipboard plugin instance
#[derive(Debug, Default)]
pub struct ClipboardPlugin {
    /// Latest content received from the remote device
    content: Option<String>,

    /// When the content was produced (epoch millis)
    timestamp: i64,
}

impl ClipboardPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest remote clipboard content
    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    /// Push a local clipboard change to the device
    pub fn send_content(&mut self, device: &DeviceHandle, content: &str) -> Result<()> {
        self.content = Some(content.to_string());
        self.timestamp = current_timestamp();
        device.send_packet(Packet::new(
            "kdeconnect.clipboard",
            json!({ "content": content }),
        ))
    }

    /// Packet announcing our content to a device that just connected
    pub fn create_connect_packet(&self) -> Option<Packet> {
        self.content.as_ref().map(|content| {
            Packet::new(
                "kdeconnect.clipboard.connect",
                json!({ "content": content, "timestamp": self.timestamp }),
            )
        })
    }
}

#[async_trait]
impl Plugin for ClipboardPlugin {
    fn descriptor(&self) -> &'static PluginDescriptor {
        &DESCRIPTOR
    }

    async fn create(&mut self, device: &DeviceHandle) -> Result<()> {
        debug!(device_id = %device.device_id(), "Clipboard plugin ready");
        Ok(())
    }

    async fn handle_packet(
        &mut self,
        packet: &Packet,
        _payload: Option<Payload>,
        device: &DeviceHandle,
    ) -> Result<bool> {
        if packet.is_type("kdeconnect.clipboard") {
            if let Some(content) = packet.get_body_field::<String>("content") {
                info!(
                    device_name = %device.device_name(),
                    bytes = content.len(),
                    "Clipboard updated from remote"
                );
                self.content = Some(content);
                self.timestamp = current_timestamp();
            }
            return Ok(true);
        }

        if packet.is_type("kdeconnect.clipboard.connect") {
            let timestamp = packet.get_body_field::<i64>("timestamp").unwrap_or(0);
            // Only adopt content that is newer than what we hold; a
            // zero timestamp means "unknown age" and is ignored.
            if timestamp > self.timestamp {
                if let Some(content) = packet.get_body_field::<String>("content") {
                    debug!(
                        device_name = %device.device_name(),
                        "Clipboard adopted on connect"
                    );
                    self.content = Some(content);
                    self.timestamp = timestamp;
                }
            }
            return Ok(true);
        }

        Ok(false)
    }

    async fn destroy(&mut self) {
        debug!("Clipboard plugin destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn handle() -> (
        DeviceHandle,
        mpsc::UnboundedReceiver<(String, crate::plugins::OutboundPacket)>,
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

    #[tokio::test]
    async fn test_content_update() {
        let (device, _rx) = handle();
        let mut plugin = ClipboardPlugin::new();

        let packet = Packet::new("kdeconnect.clipboard", json!({"content": "copied text"}));
        plugin.handle_packet(&packet, None, &device).await.unwrap();

        assert_eq!(plugin.content(), Some("copied text"));
    }

    #[tokio::test]
    async fn test_connect_packet_respects_age() {
        let (device, _rx) = handle();
        let mut plugin = ClipboardPlugin::new();

        // Fresh content arrives.
        let now = current_timestamp();
        let packet = Packet::new(
            "kdeconnect.clipboard.connect",
            json!({"content": "new", "timestamp": now}),
        );
        plugin.handle_packet(&packet, None, &device).await.unwrap();
        assert_eq!(plugin.content(), Some("new"));

        // Older content does not replace it.
        let stale = Packet::new(
            "kdeconnect.clipboard.connect",
            json!({"content": "old", "timestamp": now - 10_000}),
        );
        plugin.handle_packet(&stale, None, &device).await.unwrap();
        assert_eq!(plugin.content(), Some("new"));
    }

    #[test]
    fn test_connect_packet_creation() {
        let mut plugin = ClipboardPlugin::new();
        assert!(plugin.create_connect_packet().is_none());

        plugin.content = Some("something".to_string());
        plugin.timestamp = 12345;
        let packet = plugin.create_connect_packet().unwrap();
        assert!(packet.is_type("kdeconnect.clipboard.connect"));
        assert_eq!(packet.get_body_field::<i64>("timestamp"), Some(12345));
    }
}
