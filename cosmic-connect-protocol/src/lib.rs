//! COSMIC Connect Protocol Implementation
//!
//! A pure Rust implementation of the COSMIC Connect device-to-device
//! protocol (KDE-Connect-compatible): LAN discovery, mutually
//! authenticated TLS links, Trust-On-First-Use pairing, framed JSON
//! packets with binary payload side-channels, and capability-negotiated
//! plugin dispatch.
//!
//! ## Layers
//!
//! - [`packet`]: the framed JSON codec
//! - [`keystore`]: persistent identity, peer certificates, trust marks
//! - [`tls`]: rustls configurations with pinned-peer verification
//! - [`discovery`]: identity packets and UDP announcement
//! - [`link`]: transport links and the LAN link provider
//! - [`payload`]: binary side-channel transfers
//! - [`pairing`]: the pair state machine
//! - [`device`]: the device registry
//! - [`connection`]: the dispatcher tying it all together
//! - [`plugins`]: plugin registry, dispatcher and boundary shells
//! - [`policy`]: trusted-network gating
//! - [`urlcheck`]: SSRF-defensive URL validation

pub mod connection;
pub mod device;
pub mod discovery;
pub mod keystore;
pub mod link;
pub mod packet;
pub mod pairing;
pub mod payload;
pub mod plugins;
pub mod policy;
pub mod tls;
pub mod urlcheck;

mod error;

pub use connection::{ConnectionConfig, ConnectionHandle, ConnectionManager, DeviceEvent};
pub use device::{Device, DeviceRegistry, DeviceSnapshot};
pub use discovery::{
    DeviceInfo, DeviceType, DiscoveryEvent, UdpDiscovery, DISCOVERY_PORT,
};
pub use error::{ProtocolError, Result};
pub use keystore::{CertificateInfo, KeyStore};
pub use link::lan::{LanLinkProvider, LanProviderConfig};
pub use link::{DeviceLink, LinkEvent, LinkProvider, LinkState};
pub use packet::{current_timestamp, Packet};
pub use pairing::{PairState, PairingEvent, PairingHandler, PAIRING_TIMEOUT};
pub use payload::{Payload, PayloadSource};
pub use plugins::{DeviceHandle, Plugin, PluginDescriptor, PluginRegistry};
pub use policy::{NetworkPolicy, NetworkPolicyConfig};
pub use tls::TlsConfig;

/// Protocol version we implement
pub const PROTOCOL_VERSION: u32 = 7;
