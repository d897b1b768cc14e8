//! Find My Phone Plugin
//!
//! Makes the paired device ring so it can be located, and rings when
//! asked. The body is `{}`; the packet type itself is the command.
//!
//! Actually producing sound is a host integration; the plugin exposes a
//! ringing flag the embedder observes.

use super::{DeviceHandle, Plugin, PluginDescriptor};
use crate::payload::Payload;
use crate::{Packet, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

pub static DESCRIPTOR: PluginDescriptor = PluginDescriptor {
    key: "findmyphone",
    display_name: "Find my phone",
    description: "Ring the paired device to locate it",
    incoming: &["kdeconnect.findmyphone.request"],
    outgoing: &["kdeconnect.findmyphone.request"],
    enabled_by_default: true,
    listen_to_unpaired: false,
    permissions: &[],
};

/// Find-my-phone plugin instance
#[derive(Debug, Default)]
pub struct FindMyPhonePlugin {
    ringing: bool,
}

impl FindMyPhonePlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a ring request is active
    pub fn is_ringing(&self) -> bool {
        self.ringing
    }

    /// Stop ringing (the user found the device)
    pub fn stop_ringing(&mut self) {
        self.ringing = false;
    }

    /// Ask the peer to ring
    pub fn ring(device: &DeviceHandle) -> Result<()> {
        device.send_packet(Packet::new("kdeconnect.findmyphone.request", json!({})))
    }
}

#[async_trait]
impl Plugin for FindMyPhonePlugin {
    fn descriptor(&self) -> &'static PluginDescriptor {
        &DESCRIPTOR
    }

    async fn create(&mut self, device: &DeviceHandle) -> Result<()> {
        debug!(device_id = %device.device_id(), "Find-my-phone plugin ready");
        Ok(())
    }

    async fn handle_packet(
        &mut self,
        packet: &Packet,
        _payload: Option<Payload>,
        device: &DeviceHandle,
    ) -> Result<bool> {
        if !packet.is_type("kdeconnect.findmyphone.request") {
            return Ok(false);
        }

        info!(device_name = %device.device_name(), "Ring requested");
        self.ringing = true;
        Ok(true)
    }

    async fn destroy(&mut self) {
        self.ringing = false;
        debug!("Find-my-phone plugin destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_ring_request_sets_flag() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let device = DeviceHandle::new(
            "peer".into(),
            "Peer".into(),
            Arc::new(AtomicBool::new(true)),
            tx,
        );

        let mut plugin = FindMyPhonePlugin::new();
        assert!(!plugin.is_ringing());

        let packet = Packet::new("kdeconnect.findmyphone.request", json!({}));
        plugin.handle_packet(&packet, None, &device).await.unwrap();
        assert!(plugin.is_ringing());

        plugin.stop_ringing();
        assert!(!plugin.is_ringing());
    }
}
