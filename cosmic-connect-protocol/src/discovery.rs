//! Device Discovery
//!
//! UDP broadcast-based discovery. Devices announce themselves by
//! broadcasting identity packets on UDP port 1716; receivers open a TCP
//! connection to the announced port and run the link setup sequence.
//!
//! ## Identity Packet Format
//!
//! Identity packets (`kdeconnect.identity`) contain:
//! - `deviceId`: UUIDv4 with underscores (e.g., `740bd4b9_b418_4ee4_97d6_caf1da8151be`)
//! - `deviceName`: 1-32 character device name
//! - `deviceType`: desktop, laptop, phone, tablet, or tv
//! - `protocolVersion`: protocol version (currently 7)
//! - `incomingCapabilities`: packet types this device can receive
//! - `outgoingCapabilities`: packet types this device can send
//! - `tcpPort`: TCP port for establishing connections (optional)
//!
//! ## Port Configuration
//!
//! - Primary port: UDP 1716
//! - Fallback range: 1714-1764
//! - Listen on 0.0.0.0 for incoming broadcasts

use crate::policy::NetworkPolicy;
use crate::{Packet, ProtocolError, Result, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default UDP port for device discovery
pub const DISCOVERY_PORT: u16 = 1716;

/// Port range for fallback when the primary port is unavailable
pub const PORT_RANGE_START: u16 = 1714;
pub const PORT_RANGE_END: u16 = 1764;

/// Broadcast address for IPv4
pub const BROADCAST_ADDR: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

/// Default interval between identity broadcasts
pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(30);

/// Device types supported by the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Laptop,
    Phone,
    Tablet,
    Tv,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Tv => "tv",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "desktop" => Some(DeviceType::Desktop),
            "laptop" => Some(DeviceType::Laptop),
            "phone" => Some(DeviceType::Phone),
            "tablet" => Some(DeviceType::Tablet),
            "tv" => Some(DeviceType::Tv),
            _ => None,
        }
    }
}

/// Device identity information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Unique device identifier (UUIDv4 with underscores)
    pub device_id: String,

    /// Human-readable device name (1-32 characters)
    pub device_name: String,

    pub device_type: DeviceType,

    pub protocol_version: u32,

    /// Packet types this device can receive
    pub incoming_capabilities: Vec<String>,

    /// Packet types this device can send
    pub outgoing_capabilities: Vec<String>,

    /// TCP port for connections, absent when the device is not
    /// accepting connections
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_port: Option<u16>,
}

impl DeviceInfo {
    pub fn new(device_name: impl Into<String>, device_type: DeviceType) -> Self {
        let device_name = device_name.into();
        if device_name.is_empty() || device_name.len() > 32 {
            warn!("Device name should be 1-32 characters, got: {}", device_name);
        }

        Self {
            device_id: generate_device_id(),
            device_name,
            device_type,
            protocol_version: PROTOCOL_VERSION,
            incoming_capabilities: Vec::new(),
            outgoing_capabilities: Vec::new(),
            tcp_port: None,
        }
    }

    pub fn with_id(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_type: DeviceType,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            device_type,
            protocol_version: PROTOCOL_VERSION,
            incoming_capabilities: Vec::new(),
            outgoing_capabilities: Vec::new(),
            tcp_port: None,
        }
    }

    pub fn with_tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = Some(port);
        self
    }

    pub fn with_incoming_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.incoming_capabilities = capabilities;
        self
    }

    pub fn with_outgoing_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.outgoing_capabilities = capabilities;
        self
    }

    /// Convert to an identity packet
    pub fn to_identity_packet(&self) -> Packet {
        let mut body = json!({
            "deviceId": self.device_id,
            "deviceName": self.device_name,
            "deviceType": self.device_type.as_str(),
            "protocolVersion": self.protocol_version,
            "incomingCapabilities": self.incoming_capabilities,
            "outgoingCapabilities": self.outgoing_capabilities,
        });
        if let Some(port) = self.tcp_port {
            body["tcpPort"] = json!(port);
        }
        Packet::new("kdeconnect.identity", body)
    }

    /// Parse from an identity packet
    pub fn from_identity_packet(packet: &Packet) -> Result<Self> {
        if !packet.is_type("kdeconnect.identity") {
            return Err(ProtocolError::InvalidPacket(
                "not an identity packet".to_string(),
            ));
        }

        let device_id = packet
            .get_body_field::<String>("deviceId")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ProtocolError::InvalidPacket("missing deviceId".to_string()))?;

        let device_name = packet
            .get_body_field::<String>("deviceName")
            .ok_or_else(|| ProtocolError::InvalidPacket("missing deviceName".to_string()))?;

        let device_type_str = packet
            .get_body_field::<String>("deviceType")
            .ok_or_else(|| ProtocolError::InvalidPacket("missing deviceType".to_string()))?;

        let device_type = DeviceType::from_str_opt(&device_type_str).ok_or_else(|| {
            ProtocolError::InvalidPacket(format!("unknown device type: {}", device_type_str))
        })?;

        Ok(Self {
            device_id,
            device_name,
            device_type,
            protocol_version: packet
                .get_body_field::<u32>("protocolVersion")
                .unwrap_or(PROTOCOL_VERSION),
            incoming_capabilities: packet
                .get_body_field::<Vec<String>>("incomingCapabilities")
                .unwrap_or_default(),
            outgoing_capabilities: packet
                .get_body_field::<Vec<String>>("outgoingCapabilities")
                .unwrap_or_default(),
            tcp_port: packet.get_body_field::<u16>("tcpPort"),
        })
    }
}

/// Generate a UUIDv4 device id with underscores instead of hyphens
pub fn generate_device_id() -> String {
    Uuid::new_v4().to_string().replace('-', "_")
}

/// Events emitted by the discovery listener
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A remote device announced itself
    DeviceSeen {
        info: DeviceInfo,
        addr: SocketAddr,
    },
}

/// UDP discovery service: periodic identity broadcasts plus a listener
/// for remote announcements
pub struct UdpDiscovery {
    socket: Arc<UdpSocket>,
    device_info: DeviceInfo,
    policy: Arc<NetworkPolicy>,
    broadcast_interval: Duration,
}

impl UdpDiscovery {
    /// Bind the discovery socket, falling back through 1714-1764 when
    /// the primary port is taken
    pub async fn bind(
        device_info: DeviceInfo,
        policy: Arc<NetworkPolicy>,
        broadcast_interval: Duration,
    ) -> Result<Self> {
        let socket = Self::bind_socket()?;
        Ok(Self {
            socket: Arc::new(socket),
            device_info,
            policy,
            broadcast_interval,
        })
    }

    fn bind_socket() -> Result<UdpSocket> {
        use socket2::{Domain, Protocol, Socket, Type};

        let mut last_err: Option<std::io::Error> = None;
        let mut ports: Vec<u16> = vec![DISCOVERY_PORT];
        ports.extend((PORT_RANGE_START..=PORT_RANGE_END).filter(|p| *p != DISCOVERY_PORT));

        for port in ports {
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
            socket.set_reuse_address(true)?;
            socket.set_broadcast(true)?;
            socket.set_nonblocking(true)?;

            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
            match socket.bind(&addr.into()) {
                Ok(()) => {
                    info!("Discovery bound to UDP port {}", port);
                    return Ok(UdpSocket::from_std(socket.into())?);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(ProtocolError::Io(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "no discovery port available")
        })))
    }

    /// Local port the discovery socket is bound to
    pub fn local_port(&self) -> Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Send a single identity broadcast
    pub async fn broadcast_identity(&self) -> Result<()> {
        if !self.policy.allowed() {
            debug!("Identity broadcast suppressed by network policy");
            return Ok(());
        }

        let packet = self.device_info.to_identity_packet();
        let bytes = packet.to_bytes()?;
        let broadcast = SocketAddr::new(IpAddr::V4(BROADCAST_ADDR), DISCOVERY_PORT);

        self.socket.send_to(&bytes, broadcast).await?;
        debug!(
            "Broadcast identity for {} ({} bytes)",
            self.device_info.device_name,
            bytes.len()
        );
        Ok(())
    }

    /// Start the announcer and listener tasks
    ///
    /// Returns the receiver of discovery events and the task handles
    /// (aborted to stop discovery).
    pub fn start(self) -> (mpsc::UnboundedReceiver<DiscoveryEvent>, Vec<JoinHandle<()>>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let announcer = {
            let socket = self.socket.clone();
            let device_info = self.device_info.clone();
            let policy = self.policy.clone();
            let interval = self.broadcast_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    if !policy.allowed() {
                        continue;
                    }
                    let packet = device_info.to_identity_packet();
                    let Ok(bytes) = packet.to_bytes() else { continue };
                    let broadcast = SocketAddr::new(IpAddr::V4(BROADCAST_ADDR), DISCOVERY_PORT);
                    if let Err(e) = socket.send_to(&bytes, broadcast).await {
                        warn!("Identity broadcast failed: {}", e);
                    }
                }
            })
        };

        let listener = {
            let socket = self.socket.clone();
            let own_id = self.device_info.device_id.clone();
            let policy = self.policy.clone();

            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                loop {
                    let (size, src_addr) = match socket.recv_from(&mut buf).await {
                        Ok(r) => r,
                        Err(e) => {
                            warn!("Discovery receive failed: {}", e);
                            continue;
                        }
                    };

                    if !policy.allowed() {
                        continue;
                    }

                    let packet = match Packet::from_bytes(&buf[..size]) {
                        Ok(p) => p,
                        Err(e) => {
                            debug!("Ignoring undecodable broadcast from {}: {}", src_addr, e);
                            continue;
                        }
                    };

                    if !packet.is_type("kdeconnect.identity") {
                        continue;
                    }

                    let info = match DeviceInfo::from_identity_packet(&packet) {
                        Ok(info) => info,
                        Err(e) => {
                            debug!("Bad identity broadcast from {}: {}", src_addr, e);
                            continue;
                        }
                    };

                    if info.device_id == own_id {
                        continue;
                    }

                    info!(
                        "Discovered {} ({}) at {}",
                        info.device_name,
                        info.device_type.as_str(),
                        src_addr
                    );

                    if event_tx
                        .send(DiscoveryEvent::DeviceSeen { info, addr: src_addr })
                        .is_err()
                    {
                        break;
                    }
                }
            })
        };

        (event_rx, vec![announcer, listener])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_serialization() {
        assert_eq!(DeviceType::Desktop.as_str(), "desktop");
        assert_eq!(DeviceType::from_str_opt("tv"), Some(DeviceType::Tv));
        assert_eq!(DeviceType::from_str_opt("watch"), None);
    }

    #[test]
    fn test_device_id_format() {
        let id = generate_device_id();
        assert_eq!(id.len(), 36);
        assert_eq!(id.matches('_').count(), 4);
        assert!(!id.contains('-'));
    }

    #[test]
    fn test_identity_packet_roundtrip() {
        let original = DeviceInfo::with_id("test_device_id", "Test Device", DeviceType::Phone)
            .with_tcp_port(40123)
            .with_incoming_capabilities(vec!["kdeconnect.ping".to_string()])
            .with_outgoing_capabilities(vec!["kdeconnect.battery".to_string()]);

        let packet = original.to_identity_packet();
        assert!(packet.is_type("kdeconnect.identity"));

        let parsed = DeviceInfo::from_identity_packet(&packet).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_identity_without_tcp_port() {
        let info = DeviceInfo::with_id("id_1", "No Listener", DeviceType::Tablet);
        let packet = info.to_identity_packet();

        assert!(packet.body.get("tcpPort").is_none());
        let parsed = DeviceInfo::from_identity_packet(&packet).unwrap();
        assert_eq!(parsed.tcp_port, None);
    }

    #[test]
    fn test_missing_fields_rejected() {
        let packet = Packet::new("kdeconnect.identity", serde_json::json!({"deviceId": "x"}));
        assert!(DeviceInfo::from_identity_packet(&packet).is_err());

        let packet = Packet::new("kdeconnect.ping", serde_json::json!({}));
        assert!(DeviceInfo::from_identity_packet(&packet).is_err());
    }

    #[test]
    fn test_empty_device_id_rejected() {
        let packet = Packet::new(
            "kdeconnect.identity",
            serde_json::json!({
                "deviceId": "",
                "deviceName": "X",
                "deviceType": "phone",
            }),
        );
        assert!(DeviceInfo::from_identity_packet(&packet).is_err());
    }
}
