//! Notification Plugin
//!
//! Relays notifications between devices.
//!
//! ## Packet Types
//!
//! - `kdeconnect.notification`: a notification was posted or dismissed
//! - `kdeconnect.notification.request`: ask the peer to resend all
//!   active notifications (body `{request: true}`) or dismiss one
//!   (body `{cancel: <id>}`)
//!
//! Rendering notifications on the host is a platform integration; the
//! plugin tracks the active set per device and lets the embedder
//! enumerate, post and dismiss.

use super::{DeviceHandle, Plugin, PluginDescriptor};
use crate::payload::Payload;
use crate::{Packet, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info};

pub static DESCRIPTOR: PluginDescriptor = PluginDescriptor {
    key: "notification",
    display_name: "Notifications",
    description: "Show this device's notifications on the paired device",
    incoming: &["kdeconnect.notification", "kdeconnect.notification.request"],
    outgoing: &["kdeconnect.notification", "kdeconnect.notification.request"],
    enabled_by_default: true,
    listen_to_unpaired: false,
    permissions: &["notifications"],
};

/// A notification as carried on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteNotification {
    pub id: String,

    #[serde(rename = "appName", default)]
    pub app_name: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub text: String,

    /// Whether the notification can be dismissed from the remote side
    #[serde(rename = "isClearable", default)]
    pub is_clearable: bool,
}

/// Notification plugin instance
#[derive(Debug, Default)]
pub struct NotificationPlugin {
    /// Active notifications of the remote device, by id
    active: HashMap<String, RemoteNotification>,
}

impl NotificationPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> impl Iterator<Item = &RemoteNotification> {
        self.active.values()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Ask the peer for its current notification list
    pub fn request_all(device: &DeviceHandle) -> Result<()> {
        device.send_packet(Packet::new(
            "kdeconnect.notification.request",
            json!({ "request": true }),
        ))
    }

    /// Dismiss a notification on the peer
    pub fn dismiss(device: &DeviceHandle, id: &str) -> Result<()> {
        device.send_packet(Packet::new(
            "kdeconnect.notification.request",
            json!({ "cancel": id }),
        ))
    }
}

#[async_trait]
impl Plugin for NotificationPlugin {
    fn descriptor(&self) -> &'static PluginDescriptor {
        &DESCRIPTOR
    }

    async fn create(&mut self, device: &DeviceHandle) -> Result<()> {
        debug!(device_id = %device.device_id(), "Notification plugin ready");
        Ok(())
    }

    async fn handle_packet(
        &mut self,
        packet: &Packet,
        _payload: Option<Payload>,
        device: &DeviceHandle,
    ) -> Result<bool> {
        if packet.is_type("kdeconnect.notification") {
            let Some(id) = packet.get_body_field::<String>("id") else {
                debug!("Notification packet without id, ignoring");
                return Ok(true);
            };

            if packet.get_body_field::<bool>("isCancel").unwrap_or(false) {
                if self.active.remove(&id).is_some() {
                    debug!(id = %id, "Notification dismissed by remote");
                }
                return Ok(true);
            }

            match serde_json::from_value::<RemoteNotification>(packet.body.clone()) {
                Ok(notification) => {
                    info!(
                        device_name = %device.device_name(),
                        app = %notification.app_name,
                        "Notification received"
                    );
                    self.active.insert(id, notification);
                }
                Err(e) => debug!("Undecodable notification body: {}", e),
            }
            return Ok(true);
        }

        if packet.is_type("kdeconnect.notification.request") {
            // The local notification source is an embedder integration;
            // nothing to resend from inside the protocol core.
            debug!(
                device_name = %device.device_name(),
                "Peer requested notification list"
            );
            return Ok(true);
        }

        Ok(false)
    }

    async fn destroy(&mut self) {
        self.active.clear();
        debug!("Notification plugin destroyed");
    }
}
