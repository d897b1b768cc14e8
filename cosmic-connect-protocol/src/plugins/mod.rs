//! Plugin Architecture
//!
//! COSMIC Connect uses a **capability-based plugin system**: devices
//! advertise the packet types they can send and receive in their
//! identity packets, and a plugin is usable with a peer only when the
//! capability sets intersect.
//!
//! ## Static registry
//!
//! Plugins are registered in a plain compile-time table mapping a
//! plugin key to its descriptor and constructor, with no runtime class
//! lookup. Capability sets are therefore known before any instance
//! exists, which is what the identity packet advertises.
//!
//! ## Per-device instances
//!
//! Plugin instances are created lazily per (device, plugin): plugins
//! that listen to unpaired devices are instantiated when the device
//! becomes reachable, everything else on the first packet of a
//! supported type after pairing. Instances are destroyed in reverse
//! order of creation when the device unpairs or disappears.
//!
//! ## The device handle
//!
//! A plugin never sees the transport layer. It receives a narrow
//! [`DeviceHandle`] that can send packets (routed through the
//! connection manager), attach payloads, and answer `is_paired`. The
//! handle is invalidated when the plugin is destroyed.
//!
//! ### Packet types
//!
//! Plugin packet types follow the pattern `kdeconnect.<plugin>[.<action>]`:
//! - `kdeconnect.ping`: connectivity test
//! - `kdeconnect.battery`: battery status broadcast
//! - `kdeconnect.battery.request`: request battery status
//! - `kdeconnect.share.request`: file/URL/text share

pub mod battery;
pub mod clipboard;
pub mod findmyphone;
pub mod notification;
pub mod ping;
pub mod share;

use crate::discovery::DeviceInfo;
use crate::packet::{ALT_TYPE_PREFIX, TYPE_PREFIX};
use crate::payload::{Payload, PayloadSource};
use crate::{Packet, ProtocolError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Immutable plugin metadata, declared at compile time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginDescriptor {
    /// Unique plugin key, e.g. "ping"
    pub key: &'static str,

    pub display_name: &'static str,

    pub description: &'static str,

    /// Packet types this plugin handles
    pub incoming: &'static [&'static str],

    /// Packet types this plugin emits
    pub outgoing: &'static [&'static str],

    pub enabled_by_default: bool,

    /// Instantiate as soon as the device is reachable, before pairing
    pub listen_to_unpaired: bool,

    /// Host permissions the plugin needs (informational; enforcement is
    /// the embedder's concern)
    pub permissions: &'static [&'static str],
}

impl PluginDescriptor {
    /// Whether this plugin accepts the given (canonicalized) packet type
    pub fn accepts(&self, packet_type: &str) -> bool {
        let canonical = canonical_type(packet_type);
        self.incoming.iter().any(|t| *t == canonical)
    }
}

/// Map the alternate namespace onto the canonical one
pub fn canonical_type(packet_type: &str) -> String {
    match packet_type.strip_prefix(ALT_TYPE_PREFIX) {
        Some(suffix) => format!("{}{}", TYPE_PREFIX, suffix),
        None => packet_type.to_string(),
    }
}

/// An outbound packet queued by a plugin
#[derive(Debug)]
pub enum OutboundPacket {
    Plain(Packet),
    WithPayload {
        packet: Packet,
        source: PayloadSource,
        /// Block the sending context until the receiver drained the
        /// payload
        wait: bool,
    },
}

/// Narrow per-device handle given to plugin instances
///
/// Forwards sends to the connection manager; holds no reference into
/// the registry. Cheap to clone.
#[derive(Clone)]
pub struct DeviceHandle {
    device_id: String,
    device_name: String,
    paired: Arc<AtomicBool>,
    revoked: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<(String, OutboundPacket)>,
}

impl DeviceHandle {
    pub(crate) fn new(
        device_id: String,
        device_name: String,
        paired: Arc<AtomicBool>,
        outbound: mpsc::UnboundedSender<(String, OutboundPacket)>,
    ) -> Self {
        Self {
            device_id,
            device_name,
            paired,
            revoked: Arc::new(AtomicBool::new(false)),
            outbound,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn is_paired(&self) -> bool {
        self.paired.load(Ordering::Acquire)
    }

    /// Queue a packet to this device
    pub fn send_packet(&self, packet: Packet) -> Result<()> {
        self.send(OutboundPacket::Plain(packet))
    }

    /// Queue a packet with an attached payload
    pub fn send_packet_with_payload(
        &self,
        packet: Packet,
        source: PayloadSource,
        wait: bool,
    ) -> Result<()> {
        self.send(OutboundPacket::WithPayload {
            packet,
            source,
            wait,
        })
    }

    fn send(&self, outbound: OutboundPacket) -> Result<()> {
        if self.revoked.load(Ordering::Acquire) {
            return Err(ProtocolError::Cancelled(
                "device handle revoked".to_string(),
            ));
        }

        self.outbound
            .send((self.device_id.clone(), outbound))
            .map_err(|_| ProtocolError::Cancelled("connection manager gone".to_string()))
    }

    fn revoke(&self) {
        self.revoked.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("device_id", &self.device_id)
            .field("paired", &self.is_paired())
            .finish()
    }
}

/// Contract a plugin implementation supplies
///
/// Handlers are invoked at most once at a time per (device, plugin);
/// implementations may assume no reentrancy within that scope. Handlers
/// should process packets idempotently and log malformed bodies rather
/// than erroring.
#[async_trait]
pub trait Plugin: Send {
    fn descriptor(&self) -> &'static PluginDescriptor;

    /// Called once after construction, with the device handle
    async fn create(&mut self, device: &DeviceHandle) -> Result<()>;

    /// Handle an incoming packet of a supported type
    ///
    /// Returns whether the packet was handled. `payload` is present iff
    /// the packet declared one and the side-channel connected.
    async fn handle_packet(
        &mut self,
        packet: &Packet,
        payload: Option<Payload>,
        device: &DeviceHandle,
    ) -> Result<bool>;

    /// Called before the instance is dropped
    async fn destroy(&mut self);
}

/// A registry row: descriptor plus constructor
pub struct PluginRegistration {
    pub descriptor: &'static PluginDescriptor,
    pub constructor: fn() -> Box<dyn Plugin>,
}

impl std::fmt::Debug for PluginRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistration")
            .field("key", &self.descriptor.key)
            .finish()
    }
}

/// The built-in plugin table
pub fn builtin_registrations() -> Vec<PluginRegistration> {
    vec![
        PluginRegistration {
            descriptor: &ping::DESCRIPTOR,
            constructor: || Box::new(ping::PingPlugin::new()),
        },
        PluginRegistration {
            descriptor: &battery::DESCRIPTOR,
            constructor: || Box::new(battery::BatteryPlugin::new()),
        },
        PluginRegistration {
            descriptor: &clipboard::DESCRIPTOR,
            constructor: || Box::new(clipboard::ClipboardPlugin::new()),
        },
        PluginRegistration {
            descriptor: &notification::DESCRIPTOR,
            constructor: || Box::new(notification::NotificationPlugin::new()),
        },
        PluginRegistration {
            descriptor: &share::DESCRIPTOR,
            constructor: || Box::new(share::SharePlugin::default()),
        },
        PluginRegistration {
            descriptor: &findmyphone::DESCRIPTOR,
            constructor: || Box::new(findmyphone::FindMyPhonePlugin::new()),
        },
    ]
}

/// Registry of available plugins with enable/disable state
pub struct PluginRegistry {
    registrations: Vec<PluginRegistration>,
    disabled: Vec<&'static str>,
}

impl PluginRegistry {
    pub fn with_builtins() -> Self {
        Self::new(builtin_registrations())
    }

    pub fn new(registrations: Vec<PluginRegistration>) -> Self {
        let disabled = registrations
            .iter()
            .filter(|r| !r.descriptor.enabled_by_default)
            .map(|r| r.descriptor.key)
            .collect();
        Self {
            registrations,
            disabled,
        }
    }

    pub fn set_enabled(&mut self, key: &str, enabled: bool) {
        if enabled {
            self.disabled.retain(|k| *k != key);
        } else if self.is_enabled(key) {
            if let Some(reg) = self.registrations.iter().find(|r| r.descriptor.key == key) {
                self.disabled.push(reg.descriptor.key);
            }
        }
    }

    pub fn is_enabled(&self, key: &str) -> bool {
        !self.disabled.iter().any(|k| *k == key)
    }

    pub fn enabled_registrations(&self) -> impl Iterator<Item = &PluginRegistration> {
        self.registrations
            .iter()
            .filter(|r| self.is_enabled(r.descriptor.key))
    }

    /// All packet types enabled plugins accept, for the identity packet
    pub fn incoming_capabilities(&self) -> Vec<String> {
        let mut caps: Vec<String> = self
            .enabled_registrations()
            .flat_map(|r| r.descriptor.incoming.iter().map(|t| t.to_string()))
            .collect();
        caps.sort();
        caps.dedup();
        caps
    }

    /// All packet types enabled plugins emit, for the identity packet
    pub fn outgoing_capabilities(&self) -> Vec<String> {
        let mut caps: Vec<String> = self
            .enabled_registrations()
            .flat_map(|r| r.descriptor.outgoing.iter().map(|t| t.to_string()))
            .collect();
        caps.sort();
        caps.dedup();
        caps
    }

    /// The registration whose plugin accepts this packet type
    pub fn registration_for_packet(&self, packet_type: &str) -> Option<&PluginRegistration> {
        self.enabled_registrations()
            .find(|r| r.descriptor.accepts(packet_type))
    }

    /// Capability intersection: a plugin is usable with a peer iff one
    /// of its outgoing types is accepted by the peer, or one of the
    /// peer's outgoing types is accepted by the plugin
    pub fn usable_with(&self, peer: &DeviceInfo) -> Vec<&PluginRegistration> {
        self.enabled_registrations()
            .filter(|r| {
                let sends_something_peer_takes = r.descriptor.outgoing.iter().any(|t| {
                    peer.incoming_capabilities
                        .iter()
                        .any(|c| canonical_type(c) == *t)
                });
                let takes_something_peer_sends = peer.outgoing_capabilities.iter().any(|c| {
                    let canonical = canonical_type(c);
                    r.descriptor.incoming.iter().any(|t| *t == canonical)
                });
                sends_something_peer_takes || takes_something_peer_sends
            })
            .collect()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field(
                "plugins",
                &self
                    .registrations
                    .iter()
                    .map(|r| r.descriptor.key)
                    .collect::<Vec<_>>(),
            )
            .field("disabled", &self.disabled)
            .finish()
    }
}

/// The live plugin instances of one device
///
/// Creation order is preserved so destruction can run in reverse.
pub struct DevicePlugins {
    instances: Vec<(&'static str, Box<dyn Plugin>)>,
    index: HashMap<&'static str, usize>,
    handle: DeviceHandle,
}

impl DevicePlugins {
    pub fn new(handle: DeviceHandle) -> Self {
        Self {
            instances: Vec::new(),
            index: HashMap::new(),
            handle,
        }
    }

    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn has_instance(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Instantiate every usable plugin marked `listen_to_unpaired`
    ///
    /// Called when the device becomes reachable, before any pairing.
    pub async fn instantiate_unpaired(&mut self, registry: &PluginRegistry, peer: &DeviceInfo) {
        let usable: Vec<_> = registry
            .usable_with(peer)
            .into_iter()
            .filter(|r| r.descriptor.listen_to_unpaired)
            .map(|r| r.descriptor.key)
            .collect();

        for key in usable {
            self.ensure_instance(registry, key).await;
        }
    }

    async fn ensure_instance(&mut self, registry: &PluginRegistry, key: &'static str) -> bool {
        if self.index.contains_key(key) {
            return true;
        }

        let Some(registration) = registry
            .enabled_registrations()
            .find(|r| r.descriptor.key == key)
        else {
            return false;
        };

        let mut plugin = (registration.constructor)();
        if let Err(e) = plugin.create(&self.handle).await {
            warn!(
                plugin = key,
                device_id = %self.handle.device_id(),
                "Plugin creation failed: {}",
                e
            );
            return false;
        }

        debug!(
            plugin = key,
            device_id = %self.handle.device_id(),
            "Plugin instantiated"
        );
        self.index.insert(key, self.instances.len());
        self.instances.push((key, plugin));
        true
    }

    /// Route a packet to the plugin accepting its type
    ///
    /// Instances are created lazily on the first packet of a supported
    /// type. Unroutable packets are logged and dropped.
    pub async fn dispatch(
        &mut self,
        registry: &PluginRegistry,
        packet: &Packet,
        payload: Option<Payload>,
    ) -> Result<bool> {
        let Some(registration) = registry.registration_for_packet(&packet.packet_type) else {
            debug!(
                packet_type = %packet.packet_type,
                device_id = %self.handle.device_id(),
                "No plugin handles packet type, dropping"
            );
            return Ok(false);
        };

        let key = registration.descriptor.key;
        if !self.ensure_instance(registry, key).await {
            return Err(ProtocolError::Plugin(format!(
                "plugin {} failed to instantiate",
                key
            )));
        }

        let idx = self.index[key];
        let handle = self.handle.clone();
        let (_, plugin) = &mut self.instances[idx];
        plugin.handle_packet(packet, payload, &handle).await
    }

    /// Destroy all instances in reverse creation order and revoke the
    /// device handle
    pub async fn destroy_all(&mut self) {
        let count = self.instances.len();
        if count > 0 {
            info!(
                device_id = %self.handle.device_id(),
                "Destroying {} plugin instances",
                count
            );
        }

        for (key, mut plugin) in self.instances.drain(..).rev() {
            debug!(plugin = key, "Destroying plugin instance");
            plugin.destroy().await;
        }
        self.index.clear();
        self.handle.revoke();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DeviceType;
    use serde_json::json;

    fn test_handle() -> (
        DeviceHandle,
        mpsc::UnboundedReceiver<(String, OutboundPacket)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = DeviceHandle::new(
            "peer_1".to_string(),
            "Peer One".to_string(),
            Arc::new(AtomicBool::new(true)),
            tx,
        );
        (handle, rx)
    }

    fn peer_with_capabilities(incoming: &[&str], outgoing: &[&str]) -> DeviceInfo {
        DeviceInfo::with_id("peer_1", "Peer One", DeviceType::Phone)
            .with_incoming_capabilities(incoming.iter().map(|s| s.to_string()).collect())
            .with_outgoing_capabilities(outgoing.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_canonical_type() {
        assert_eq!(canonical_type("cosmicconnect.ping"), "kdeconnect.ping");
        assert_eq!(canonical_type("kdeconnect.ping"), "kdeconnect.ping");
        assert_eq!(canonical_type("other.thing"), "other.thing");
    }

    #[test]
    fn test_registry_capabilities() {
        let registry = PluginRegistry::with_builtins();
        let incoming = registry.incoming_capabilities();

        assert!(incoming.contains(&"kdeconnect.ping".to_string()));
        assert!(incoming.contains(&"kdeconnect.battery".to_string()));
        assert!(incoming.contains(&"kdeconnect.share.request".to_string()));

        // Sorted and deduplicated.
        let mut sorted = incoming.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(incoming, sorted);
    }

    #[test]
    fn test_registry_disable() {
        let mut registry = PluginRegistry::with_builtins();
        assert!(registry.is_enabled("ping"));
        assert!(registry
            .registration_for_packet("kdeconnect.ping")
            .is_some());

        registry.set_enabled("ping", false);
        assert!(!registry.is_enabled("ping"));
        assert!(registry
            .registration_for_packet("kdeconnect.ping")
            .is_none());
        assert!(!registry
            .incoming_capabilities()
            .contains(&"kdeconnect.ping".to_string()));

        registry.set_enabled("ping", true);
        assert!(registry.is_enabled("ping"));
    }

    #[test]
    fn test_capability_intersection() {
        let registry = PluginRegistry::with_builtins();

        // Peer only speaks ping.
        let peer = peer_with_capabilities(&["kdeconnect.ping"], &["kdeconnect.ping"]);
        let usable = registry.usable_with(&peer);
        assert!(usable.iter().any(|r| r.descriptor.key == "ping"));
        assert!(!usable.iter().any(|r| r.descriptor.key == "battery"));

        // Peer with no capabilities matches nothing.
        let peer = peer_with_capabilities(&[], &[]);
        assert!(registry.usable_with(&peer).is_empty());

        // Alternate namespace still intersects.
        let peer = peer_with_capabilities(&["cosmicconnect.ping"], &[]);
        let usable = registry.usable_with(&peer);
        assert!(usable.iter().any(|r| r.descriptor.key == "ping"));
    }

    #[tokio::test]
    async fn test_lazy_instantiation_and_dispatch() {
        let registry = PluginRegistry::with_builtins();
        let (handle, _rx) = test_handle();
        let mut plugins = DevicePlugins::new(handle);

        assert_eq!(plugins.instance_count(), 0);

        let packet = Packet::new("kdeconnect.ping", json!({"message": "hi"}));
        let handled = plugins.dispatch(&registry, &packet, None).await.unwrap();
        assert!(handled);
        assert_eq!(plugins.instance_count(), 1);
        assert!(plugins.has_instance("ping"));

        // Second ping reuses the instance.
        plugins.dispatch(&registry, &packet, None).await.unwrap();
        assert_eq!(plugins.instance_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_type_dropped() {
        let registry = PluginRegistry::with_builtins();
        let (handle, _rx) = test_handle();
        let mut plugins = DevicePlugins::new(handle);

        let packet = Packet::new("kdeconnect.nonexistent", json!({}));
        let handled = plugins.dispatch(&registry, &packet, None).await.unwrap();
        assert!(!handled);
        assert_eq!(plugins.instance_count(), 0);
    }

    #[tokio::test]
    async fn test_destroy_revokes_handle() {
        let registry = PluginRegistry::with_builtins();
        let (handle, _rx) = test_handle();
        let outer_handle = handle.clone();
        let mut plugins = DevicePlugins::new(handle);

        let packet = Packet::new("kdeconnect.ping", json!({}));
        plugins.dispatch(&registry, &packet, None).await.unwrap();

        plugins.destroy_all().await;
        assert_eq!(plugins.instance_count(), 0);

        let err = outer_handle
            .send_packet(Packet::new("kdeconnect.ping", json!({})))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_unpaired_instantiation() {
        let registry = PluginRegistry::with_builtins();
        let (handle, _rx) = test_handle();
        let mut plugins = DevicePlugins::new(handle);

        let peer = peer_with_capabilities(
            &["kdeconnect.ping", "kdeconnect.findmyphone.request"],
            &["kdeconnect.ping"],
        );
        plugins.instantiate_unpaired(&registry, &peer).await;

        // ping is listen-to-unpaired, findmyphone is not.
        assert!(plugins.has_instance("ping"));
        assert!(!plugins.has_instance("findmyphone"));
    }
}
