//! Battery Plugin
//!
//! Exchanges battery status between devices.
//!
//! ## Packet Format
//!
//! ```json
//! {
//!     "type": "kdeconnect.battery",
//!     "body": {
//!         "currentCharge": 85,
//!         "isCharging": true,
//!         "thresholdEvent": 0
//!     }
//! }
//! ```
//!
//! - `currentCharge` (i32): percentage, -1 when the device has no battery
//! - `isCharging` (bool)
//! - `thresholdEvent` (i32): 1 when the battery just dropped below the
//!   low threshold, 0 otherwise
//!
//! `kdeconnect.battery.request` asks the peer to report immediately.
//! Reading the *local* battery is a host integration and happens outside
//! this crate; the plugin answers requests from whatever the embedder
//! last pushed via [`BatteryPlugin::set_local_status`].

use super::{DeviceHandle, Plugin, PluginDescriptor};
use crate::payload::Payload;
use crate::{Packet, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

pub static DESCRIPTOR: PluginDescriptor = PluginDescriptor {
    key: "battery",
    display_name: "Battery",
    description: "Share battery status between devices",
    incoming: &["kdeconnect.battery", "kdeconnect.battery.request"],
    outgoing: &["kdeconnect.battery", "kdeconnect.battery.request"],
    enabled_by_default: true,
    listen_to_unpaired: false,
    permissions: &[],
};

/// A battery report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryStatus {
    #[serde(rename = "currentCharge")]
    pub current_charge: i32,

    #[serde(rename = "isCharging")]
    pub is_charging: bool,

    #[serde(rename = "thresholdEvent")]
    pub threshold_event: i32,
}

impl BatteryStatus {
    pub fn new(current_charge: i32, is_charging: bool, threshold_event: i32) -> Self {
        Self {
            current_charge,
            is_charging,
            threshold_event,
        }
    }

    /// Report for a device without a battery
    pub fn no_battery() -> Self {
        Self {
            current_charge: -1,
            is_charging: false,
            threshold_event: 0,
        }
    }

    pub fn has_battery(&self) -> bool {
        self.current_charge >= 0
    }
}

/// Battery plugin instance
#[derive(Debug, Default)]
pub struct BatteryPlugin {
    /// Last status reported by the remote device
    remote_status: Option<BatteryStatus>,

    /// Local status pushed by the embedder, reported on request
    local_status: Option<BatteryStatus>,
}

impl BatteryPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remote_status(&self) -> Option<BatteryStatus> {
        self.remote_status
    }

    /// Push the local battery state; also broadcasts it to the device
    pub fn set_local_status(
        &mut self,
        device: &DeviceHandle,
        status: BatteryStatus,
    ) -> Result<()> {
        self.local_status = Some(status);
        device.send_packet(Self::create_status_packet(&status))
    }

    pub fn create_status_packet(status: &BatteryStatus) -> Packet {
        Packet::new(
            "kdeconnect.battery",
            json!({
                "currentCharge": status.current_charge,
                "isCharging": status.is_charging,
                "thresholdEvent": status.threshold_event,
            }),
        )
    }

    pub fn create_request_packet() -> Packet {
        Packet::new("kdeconnect.battery.request", json!({ "request": true }))
    }
}

#[async_trait]
impl Plugin for BatteryPlugin {
    fn descriptor(&self) -> &'static PluginDescriptor {
        &DESCRIPTOR
    }

    async fn create(&mut self, device: &DeviceHandle) -> Result<()> {
        debug!(device_id = %device.device_id(), "Battery plugin ready");
        Ok(())
    }

    async fn handle_packet(
        &mut self,
        packet: &Packet,
        _payload: Option<Payload>,
        device: &DeviceHandle,
    ) -> Result<bool> {
        if packet.is_type("kdeconnect.battery.request") {
            // Answer with whatever the embedder reported; an absent
            // local state reads as "no battery".
            let status = self.local_status.unwrap_or_else(BatteryStatus::no_battery);
            device.send_packet(Self::create_status_packet(&status))?;
            return Ok(true);
        }

        if packet.is_type("kdeconnect.battery") {
            let status: BatteryStatus = serde_json::from_value(packet.body.clone())
                .unwrap_or_else(|_| BatteryStatus::no_battery());

            info!(
                device_name = %device.device_name(),
                charge = status.current_charge,
                charging = status.is_charging,
                "Battery report"
            );
            self.remote_status = Some(status);
            return Ok(true);
        }

        Ok(false)
    }

    async fn destroy(&mut self) {
        debug!("Battery plugin destroyed");
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
    fn test_status_packet() {
        let status = BatteryStatus::new(85, true, 0);
        let packet = BatteryPlugin::create_status_packet(&status);

        assert!(packet.is_type("kdeconnect.battery"));
        assert_eq!(packet.get_body_field::<i32>("currentCharge"), Some(85));
        assert_eq!(packet.get_body_field::<bool>("isCharging"), Some(true));
    }

    #[test]
    fn test_no_battery() {
        let status = BatteryStatus::no_battery();
        assert!(!status.has_battery());
        assert_eq!(status.current_charge, -1);
    }

    #[tokio::test]
    async fn test_remote_report_cached() {
        let (device, _rx) = handle();
        let mut plugin = BatteryPlugin::new();

        let packet = Packet::new(
            "kdeconnect.battery",
            json!({"currentCharge": 42, "isCharging": false, "thresholdEvent": 1}),
        );
        plugin.handle_packet(&packet, None, &device).await.unwrap();

        let status = plugin.remote_status().unwrap();
        assert_eq!(status.current_charge, 42);
        assert_eq!(status.threshold_event, 1);
    }

    #[tokio::test]
    async fn test_request_answered() {
        let (device, mut rx) = handle();
        let mut plugin = BatteryPlugin::new();
        plugin.local_status = Some(BatteryStatus::new(77, true, 0));

        let request = BatteryPlugin::create_request_packet();
        plugin.handle_packet(&request, None, &device).await.unwrap();

        let (_, outbound) = rx.recv().await.unwrap();
        match outbound {
            OutboundPacket::Plain(p) => {
                assert!(p.is_type("kdeconnect.battery"));
                assert_eq!(p.get_body_field::<i32>("currentCharge"), Some(77));
            }
            other => panic!("unexpected outbound: {:?}", other),
        }
    }
}
