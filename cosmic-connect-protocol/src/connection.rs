//! Connection Manager
//!
//! The dispatcher at the center of the core: consumes link events from
//! every provider, owns the device registry and all pair state, and
//! routes packets between the pairing layer and the plugin dispatcher.
//!
//! All registry and pair-state mutations happen on one dispatcher task;
//! everything else talks to it through channels. Outbound sends pick
//! the highest-priority usable link of a device and fall through to the
//! next link when a write fails.
//!
//! ## Routing
//!
//! - `kdeconnect.pair` → pair state machine;
//! - anything else, device paired → plugin dispatcher;
//! - anything else, device unpaired → discarded, and a `pair{false}`
//!   goes back so a stale peer session cannot keep leaking packets.
//!
//! ## Shutdown
//!
//! Two phases: the embedder stops the link providers (no new links),
//! then [`ConnectionHandle::shutdown`] closes the remaining links and
//! destroys every plugin instance before the dispatcher exits.

use crate::device::{Device, DeviceRegistry, DeviceSnapshot, DEFAULT_REGISTRY_GRACE_SECS};
use crate::discovery::DeviceInfo;
use crate::keystore::KeyStore;
use crate::link::{DeviceLink, LinkEvent, LinkId, LinkState};
use crate::pairing::{
    PairTransition, PairingEvent, PairingHandler, PairingPacket, RequestOutcome, PAIRING_TIMEOUT,
};
use crate::payload::{Payload, PayloadSource};
use crate::plugins::{DeviceHandle, DevicePlugins, OutboundPacket, PluginRegistry};
use crate::{Packet, ProtocolError, Result};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Interval between keepalive pings to paired devices
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Connection manager configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Deadline for pairing requests
    pub pairing_timeout: Duration,

    /// Where to persist the device registry; `None` keeps it in memory
    pub registry_path: Option<PathBuf>,

    /// Grace period before unpaired, unreachable devices are dropped
    pub registry_grace_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pairing_timeout: PAIRING_TIMEOUT,
            registry_path: None,
            registry_grace_secs: DEFAULT_REGISTRY_GRACE_SECS,
        }
    }
}

/// Observable device lifecycle events
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// First usable link to a device appeared
    Reachable { device_id: String, info: DeviceInfo },

    /// The last link to a device went away
    Unreachable { device_id: String },

    Pairing(PairingEvent),
}

enum Command {
    Send {
        device_id: String,
        outbound: OutboundPacket,
        reply: oneshot::Sender<Result<()>>,
    },
    RequestPair {
        device_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    AcceptPair {
        device_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    RejectPair {
        device_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Unpair {
        device_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        device_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    PairDeadline {
        device_id: String,
        generation: u64,
    },
    Snapshots {
        reply: oneshot::Sender<Vec<DeviceSnapshot>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Clonable async API onto the dispatcher task
#[derive(Clone)]
pub struct ConnectionHandle {
    command_tx: mpsc::UnboundedSender<Command>,
}

impl ConnectionHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
        default: impl FnOnce() -> T,
    ) -> T {
        let (tx, rx) = oneshot::channel();
        if self.command_tx.send(make(tx)).is_err() {
            return default();
        }
        rx.await.unwrap_or_else(|_| default())
    }

    fn gone<T>() -> Result<T> {
        Err(ProtocolError::Cancelled(
            "connection manager stopped".to_string(),
        ))
    }

    /// Send a packet to a device over its best link
    pub async fn send_packet(&self, device_id: &str, packet: Packet) -> Result<()> {
        let device_id = device_id.to_string();
        self.call(
            |reply| Command::Send {
                device_id,
                outbound: OutboundPacket::Plain(packet),
                reply,
            },
            || Self::gone(),
        )
        .await
    }

    /// Send a packet with an attached payload
    pub async fn send_packet_with_payload(
        &self,
        device_id: &str,
        packet: Packet,
        source: PayloadSource,
        wait: bool,
    ) -> Result<()> {
        let device_id = device_id.to_string();
        self.call(
            |reply| Command::Send {
                device_id,
                outbound: OutboundPacket::WithPayload {
                    packet,
                    source,
                    wait,
                },
                reply,
            },
            || Self::gone(),
        )
        .await
    }

    pub async fn request_pair(&self, device_id: &str) -> Result<()> {
        let device_id = device_id.to_string();
        self.call(
            |reply| Command::RequestPair { device_id, reply },
            || Self::gone(),
        )
        .await
    }

    pub async fn accept_pair(&self, device_id: &str) -> Result<()> {
        let device_id = device_id.to_string();
        self.call(
            |reply| Command::AcceptPair { device_id, reply },
            || Self::gone(),
        )
        .await
    }

    pub async fn reject_pair(&self, device_id: &str) -> Result<()> {
        let device_id = device_id.to_string();
        self.call(
            |reply| Command::RejectPair { device_id, reply },
            || Self::gone(),
        )
        .await
    }

    pub async fn unpair(&self, device_id: &str) -> Result<()> {
        let device_id = device_id.to_string();
        self.call(
            |reply| Command::Unpair { device_id, reply },
            || Self::gone(),
        )
        .await
    }

    /// Close every link to a device
    pub async fn disconnect(&self, device_id: &str) -> Result<()> {
        let device_id = device_id.to_string();
        self.call(
            |reply| Command::Disconnect { device_id, reply },
            || Self::gone(),
        )
        .await
    }

    /// Snapshots of every known device
    pub async fn devices(&self) -> Vec<DeviceSnapshot> {
        self.call(|reply| Command::Snapshots { reply }, Vec::new)
            .await
    }

    /// Phase two of shutdown: close links, destroy plugins, stop the
    /// dispatcher
    pub async fn shutdown(&self) {
        self.call(|reply| Command::Shutdown { reply }, || ()).await
    }
}

/// The running connection manager
pub struct ConnectionManager {
    handle: ConnectionHandle,
    link_events: mpsc::UnboundedSender<LinkEvent>,
    events: Option<mpsc::UnboundedReceiver<DeviceEvent>>,
    task: JoinHandle<()>,
}

impl ConnectionManager {
    /// Start the dispatcher task
    pub fn start(
        keystore: Arc<RwLock<KeyStore>>,
        plugin_registry: PluginRegistry,
        config: ConnectionConfig,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let registry = match &config.registry_path {
            Some(path) => DeviceRegistry::with_persistence(path, config.registry_grace_secs),
            None => DeviceRegistry::ephemeral(),
        };

        let dispatcher = Dispatcher {
            keystore,
            plugin_registry,
            devices: registry,
            config,
            event_tx,
            command_tx: command_tx.clone(),
            outbound_tx,
        };

        let task = tokio::spawn(dispatcher.run(command_rx, link_rx, outbound_rx));

        Self {
            handle: ConnectionHandle { command_tx },
            link_events: link_tx,
            events: Some(event_rx),
            task,
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Sender the link providers push their events into
    pub fn link_event_sender(&self) -> mpsc::UnboundedSender<LinkEvent> {
        self.link_events.clone()
    }

    /// Take the device event stream (once)
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<DeviceEvent>> {
        self.events.take()
    }

    /// Shut down and wait for the dispatcher to finish
    pub async fn shutdown(self) {
        self.handle.shutdown().await;
        let _ = self.task.await;
    }
}

struct Dispatcher {
    keystore: Arc<RwLock<KeyStore>>,
    plugin_registry: PluginRegistry,
    devices: DeviceRegistry,
    config: ConnectionConfig,
    event_tx: mpsc::UnboundedSender<DeviceEvent>,
    command_tx: mpsc::UnboundedSender<Command>,
    outbound_tx: mpsc::UnboundedSender<(String, OutboundPacket)>,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut command_rx: mpsc::UnboundedReceiver<Command>,
        mut link_rx: mpsc::UnboundedReceiver<LinkEvent>,
        mut outbound_rx: mpsc::UnboundedReceiver<(String, OutboundPacket)>,
    ) {
        self.restore_persisted().await;

        // Keepalives go to paired devices only; the first tick is
        // skipped so a fresh daemon does not ping before anyone is
        // paired.
        let mut keepalive = tokio::time::interval_at(
            tokio::time::Instant::now() + KEEPALIVE_INTERVAL,
            KEEPALIVE_INTERVAL,
        );

        loop {
            tokio::select! {
                Some(event) = link_rx.recv() => {
                    self.handle_link_event(event).await;
                }
                Some((device_id, outbound)) = outbound_rx.recv() => {
                    if let Err(e) = self.send_outbound(&device_id, outbound).await {
                        warn!(device_id = %device_id, "Plugin send failed: {}", e);
                    }
                }
                Some(command) = command_rx.recv() => {
                    if self.handle_command(command).await {
                        break;
                    }
                }
                _ = keepalive.tick() => {
                    self.send_keepalives().await;
                }
                else => break,
            }
        }

        debug!("Dispatcher exited");
    }

    /// Ping every paired, reachable device so idle links are noticed
    /// when they die. Unpaired devices never receive non-pair packets.
    async fn send_keepalives(&mut self) {
        let targets: Vec<String> = self
            .devices
            .devices()
            .filter(|d| d.is_paired() && d.is_reachable())
            .map(|d| d.id().to_string())
            .collect();

        for device_id in targets {
            let ping = Packet::new("kdeconnect.ping", serde_json::json!({}));
            if let Err(e) = self.send_best(&device_id, &ping).await {
                debug!(device_id = %device_id, "Keepalive failed: {}", e);
            }
        }
    }

    /// Rebuild device entries for peers persisted across restarts
    async fn restore_persisted(&mut self) {
        let persisted = match self.devices.load_persisted() {
            Ok(p) => p,
            Err(e) => {
                warn!("Could not load device registry: {}", e);
                return;
            }
        };

        let keystore = self.keystore.read().await;
        for (info, was_paired, last_seen) in persisted {
            // Trust lives in the key store; the registry only remembers
            // the device. Disagreements resolve toward the key store.
            let paired = was_paired && keystore.is_trusted(&info.device_id);
            let mut device = self.new_device(info, paired);
            device.last_seen = last_seen;
            self.devices.insert(device);
        }
        drop(keystore);

        if !self.devices.is_empty() {
            info!("Restored {} known devices", self.devices.len());
        }
    }

    fn new_device(&self, info: DeviceInfo, paired: bool) -> Device {
        let paired_flag = Arc::new(AtomicBool::new(paired));
        let handle = DeviceHandle::new(
            info.device_id.clone(),
            info.device_name.clone(),
            paired_flag.clone(),
            self.outbound_tx.clone(),
        );
        let pairing = if paired {
            PairingHandler::new_paired(&info.device_id, self.config.pairing_timeout)
        } else {
            PairingHandler::new(&info.device_id, self.config.pairing_timeout)
        };
        Device::new(info, pairing, DevicePlugins::new(handle), paired_flag)
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Identified {
                link,
                info,
                certificate,
                fingerprint,
            } => {
                self.on_identified(link, info, certificate, fingerprint)
                    .await;
            }
            LinkEvent::PacketReceived {
                link_id,
                device_id,
                packet,
                payload,
            } => {
                self.on_packet(link_id, &device_id, packet, payload).await;
            }
            LinkEvent::Closed {
                link_id,
                device_id,
                reason,
            } => {
                self.on_link_closed(link_id, device_id, &reason).await;
            }
        }
    }

    async fn on_identified(
        &mut self,
        link: Arc<dyn DeviceLink>,
        info: DeviceInfo,
        certificate: Vec<u8>,
        fingerprint: String,
    ) {
        let device_id = info.device_id.clone();

        // Install the certificate; for a trusted peer this is a no-op
        // (the pinned certificate already matched at the handshake).
        {
            let mut keystore = self.keystore.write().await;
            if let Err(e) = keystore.put_peer_certificate(&device_id, &certificate) {
                error!(device_id = %device_id, "Refusing link: {}", e);
                link.close("certificate conflict").await;
                return;
            }
        }

        if !self.devices.contains(&device_id) {
            let paired = self.keystore.read().await.is_trusted(&device_id);
            let device = self.new_device(info.clone(), paired);
            self.devices.insert(device);
        }

        let device = self
            .devices
            .get_mut(&device_id)
            .expect("device inserted above");

        // Capability sets may have changed since the last contact.
        device.info = info.clone();
        device.session_fingerprint = Some(fingerprint);
        link.set_state(LinkState::Ready);
        let became_reachable = device.add_link(link);

        if became_reachable {
            // Instances from an earlier reachable period were destroyed
            // and their handle revoked; plugins start over with a fresh
            // handle.
            let handle = DeviceHandle::new(
                device_id.clone(),
                info.device_name.clone(),
                device.paired_flag(),
                self.outbound_tx.clone(),
            );
            device.plugins = DevicePlugins::new(handle);
            device
                .plugins
                .instantiate_unpaired(&self.plugin_registry, &info)
                .await;

            let _ = self.event_tx.send(DeviceEvent::Reachable {
                device_id: device_id.clone(),
                info,
            });
        }

        if let Err(e) = self.devices.save() {
            warn!("Device registry save failed: {}", e);
        }
    }

    async fn on_packet(
        &mut self,
        link_id: LinkId,
        device_id: &str,
        packet: Packet,
        payload: Option<Payload>,
    ) {
        let Some(device) = self.devices.get_mut(device_id) else {
            debug!(device_id, "Packet for unknown device, dropping");
            return;
        };
        device.touch();

        if packet.is_type("kdeconnect.pair") {
            self.on_pair_packet(link_id, device_id, &packet).await;
            return;
        }

        let device = self.devices.get_mut(device_id).expect("checked above");
        if device.is_paired() {
            match device
                .plugins
                .dispatch(&self.plugin_registry, &packet, payload)
                .await
            {
                Ok(_) => {}
                Err(e) => warn!(
                    device_id,
                    packet_type = %packet.packet_type,
                    "Plugin dispatch failed: {}",
                    e
                ),
            }
        } else {
            // A non-pair packet from an unpaired peer means the peer
            // believes in a pairing we do not have. Force it to re-pair.
            debug!(
                device_id,
                packet_type = %packet.packet_type,
                "Discarding packet from unpaired device, answering pair{{false}}"
            );
            let unpair = PairingPacket::unpair();
            if let Err(e) = self.send_on_link_or_best(device_id, link_id, &unpair).await {
                debug!(device_id, "Could not send forced unpair: {}", e);
            }
        }
    }

    async fn on_pair_packet(&mut self, link_id: LinkId, device_id: &str, packet: &Packet) {
        let pair = match PairingPacket::from_packet(packet) {
            Ok(p) => p.pair,
            Err(e) => {
                warn!(device_id, "Bad pair packet: {}", e);
                return;
            }
        };

        // Invariant: the session certificate must match the stored one,
        // when anything is stored.
        let stored = self.keystore.read().await.peer_fingerprint(device_id);
        let device = self.devices.get_mut(device_id).expect("caller checked");
        if let (Some(stored), Some(session)) = (stored, device.session_fingerprint.as_deref()) {
            if stored != session {
                error!(
                    device_id,
                    "Pair packet on a session with a mismatched certificate"
                );
                for link in device.links_by_priority() {
                    if link.id() == link_id {
                        link.close("peer identity mismatch").await;
                    }
                }
                return;
            }
        }

        let transition = device.pairing.handle_packet(pair, Instant::now());
        device.sync_paired_flag();

        match transition {
            PairTransition::RequestReceived { deadline } => {
                let their_fingerprint = device.session_fingerprint.clone().unwrap_or_default();
                let device_name = device.name().to_string();
                self.arm_pair_deadline(device_id, deadline);
                self.emit_pairing(PairingEvent::RequestReceived {
                    device_id: device_id.to_string(),
                    device_name,
                    their_fingerprint,
                });
            }
            PairTransition::PeerAccepted => {
                self.finish_pairing(device_id).await;
            }
            PairTransition::AlreadyPaired => {
                // Re-acknowledge so both ends settle on paired.
                let accept = PairingPacket::accept();
                let _ = self.send_on_link_or_best(device_id, link_id, &accept).await;
            }
            PairTransition::DuplicateRequest => {
                debug!(device_id, "Duplicate pairing request ignored");
            }
            PairTransition::PeerRejected => {
                self.emit_pairing(PairingEvent::Rejected {
                    device_id: device_id.to_string(),
                    reason: Some("peer rejected".to_string()),
                });
            }
            PairTransition::PeerUnpaired => {
                self.revoke_pairing(device_id, true).await;
            }
            PairTransition::NoEffect => {}
        }
    }

    /// Complete a successful pairing: pin trust, flip the flag, notify
    async fn finish_pairing(&mut self, device_id: &str) {
        {
            let mut keystore = self.keystore.write().await;
            if let Err(e) = keystore.mark_trusted(device_id) {
                error!(device_id, "Could not mark peer trusted: {}", e);
            }
        }

        if let Some(device) = self.devices.get_mut(device_id) {
            device.sync_paired_flag();
        }
        if let Err(e) = self.devices.save() {
            warn!("Device registry save failed: {}", e);
        }

        info!(device_id, "Paired");
        self.emit_pairing(PairingEvent::Paired {
            device_id: device_id.to_string(),
        });
    }

    /// Tear down a pairing: drop trust and certificate, destroy plugins
    async fn revoke_pairing(&mut self, device_id: &str, by_peer: bool) {
        {
            let mut keystore = self.keystore.write().await;
            if let Err(e) = keystore.remove_peer(device_id) {
                warn!(device_id, "Could not remove peer trust: {}", e);
            }
        }

        if let Some(device) = self.devices.get_mut(device_id) {
            device.sync_paired_flag();
            device.plugins.destroy_all().await;

            // The device may still be reachable; unpaired-listening
            // plugins come back with a fresh handle.
            if device.is_reachable() {
                let handle = DeviceHandle::new(
                    device_id.to_string(),
                    device.info.device_name.clone(),
                    device.paired_flag(),
                    self.outbound_tx.clone(),
                );
                device.plugins = DevicePlugins::new(handle);
                let info = device.info.clone();
                device
                    .plugins
                    .instantiate_unpaired(&self.plugin_registry, &info)
                    .await;
            }
        }
        if let Err(e) = self.devices.save() {
            warn!("Device registry save failed: {}", e);
        }

        info!(device_id, by_peer, "Unpaired");
        self.emit_pairing(PairingEvent::Unpaired {
            device_id: device_id.to_string(),
            by_peer,
        });
    }

    async fn on_link_closed(&mut self, link_id: LinkId, device_id: Option<String>, reason: &str) {
        let Some(device_id) = device_id else { return };
        let Some(device) = self.devices.get_mut(&device_id) else {
            return;
        };

        debug!(device_id = %device_id, link = %link_id, "Link closed: {}", reason);
        let became_unreachable = device.remove_link(link_id);

        if became_unreachable {
            device.plugins.destroy_all().await;
            let _ = self.event_tx.send(DeviceEvent::Unreachable {
                device_id: device_id.clone(),
            });
        }

        self.devices.cleanup_stale();
    }

    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Send {
                device_id,
                outbound,
                reply,
            } => {
                let result = self.send_outbound(&device_id, outbound).await;
                let _ = reply.send(result);
            }
            Command::RequestPair { device_id, reply } => {
                let result = self.request_pair(&device_id).await;
                let _ = reply.send(result);
            }
            Command::AcceptPair { device_id, reply } => {
                let result = self.accept_pair(&device_id).await;
                let _ = reply.send(result);
            }
            Command::RejectPair { device_id, reply } => {
                let result = self.reject_pair(&device_id).await;
                let _ = reply.send(result);
            }
            Command::Unpair { device_id, reply } => {
                let result = self.unpair(&device_id).await;
                let _ = reply.send(result);
            }
            Command::Disconnect { device_id, reply } => {
                let result = match self.devices.get_mut(&device_id) {
                    Some(device) => {
                        let was_reachable = device.is_reachable();
                        device.close_all_links("disconnect requested").await;
                        device.plugins.destroy_all().await;
                        if was_reachable {
                            let _ = self.event_tx.send(DeviceEvent::Unreachable {
                                device_id: device_id.clone(),
                            });
                        }
                        Ok(())
                    }
                    None => Err(ProtocolError::DeviceNotFound(device_id)),
                };
                let _ = reply.send(result);
            }
            Command::PairDeadline {
                device_id,
                generation,
            } => {
                self.on_pair_deadline(&device_id, generation);
            }
            Command::Snapshots { reply } => {
                let _ = reply.send(self.devices.snapshots());
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    async fn request_pair(&mut self, device_id: &str) -> Result<()> {
        let our_fingerprint = self.keystore.read().await.fingerprint().to_string();
        let device = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;

        if !device.is_reachable() {
            return Err(ProtocolError::NoLinkAvailable(device_id.to_string()));
        }

        match device.pairing.request(Instant::now())? {
            RequestOutcome::Sent { packet, deadline } => {
                self.send_best(device_id, &packet).await?;
                self.arm_pair_deadline(device_id, deadline);
                self.emit_pairing(PairingEvent::RequestSent {
                    device_id: device_id.to_string(),
                    our_fingerprint,
                });
                Ok(())
            }
            RequestOutcome::AcceptedPending { packet } => {
                // The peer asked first; requesting now means accepting.
                self.send_best(device_id, &packet).await?;
                self.finish_pairing(device_id).await;
                Ok(())
            }
        }
    }

    async fn accept_pair(&mut self, device_id: &str) -> Result<()> {
        let device = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;

        let packet = device.pairing.accept()?;
        device.sync_paired_flag();
        self.send_best(device_id, &packet).await?;
        self.finish_pairing(device_id).await;
        Ok(())
    }

    async fn reject_pair(&mut self, device_id: &str) -> Result<()> {
        let device = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;

        let packet = device.pairing.reject()?;
        device.sync_paired_flag();
        let _ = self.send_best(device_id, &packet).await;
        self.emit_pairing(PairingEvent::Rejected {
            device_id: device_id.to_string(),
            reason: Some("rejected locally".to_string()),
        });
        Ok(())
    }

    async fn unpair(&mut self, device_id: &str) -> Result<()> {
        let device = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;

        let packet = device.pairing.unpair();
        device.sync_paired_flag();
        // Best effort: the peer may already be gone.
        let _ = self.send_best(device_id, &packet).await;
        self.revoke_pairing(device_id, false).await;
        Ok(())
    }

    fn on_pair_deadline(&mut self, device_id: &str, generation: u64) {
        let Some(device) = self.devices.get_mut(device_id) else {
            return;
        };

        if device.pairing.deadline_expired(generation, Instant::now()) {
            device.sync_paired_flag();
            let timeout_secs = device.pairing.timeout_secs();
            info!(device_id, timeout_secs, "Pairing timed out");
            self.emit_pairing(PairingEvent::Timeout {
                device_id: device_id.to_string(),
            });
        }
    }

    fn arm_pair_deadline(&self, device_id: &str, deadline: Instant) {
        let Some(device) = self.devices.get(device_id) else {
            return;
        };
        let generation = device.pairing.generation();
        let command_tx = self.command_tx.clone();
        let device_id = device_id.to_string();

        tokio::spawn(async move {
            tokio::time::sleep_until(deadline.into()).await;
            let _ = command_tx.send(Command::PairDeadline {
                device_id,
                generation,
            });
        });
    }

    /// Send on the highest-priority usable link, falling through on
    /// write failures
    async fn send_best(&mut self, device_id: &str, packet: &Packet) -> Result<()> {
        self.send_outbound(device_id, OutboundPacket::Plain(packet.clone()))
            .await
    }

    /// Prefer the link a packet arrived on (for protocol answers), fall
    /// back to the best link
    async fn send_on_link_or_best(
        &mut self,
        device_id: &str,
        link_id: LinkId,
        packet: &Packet,
    ) -> Result<()> {
        if let Some(device) = self.devices.get(device_id) {
            if let Some(link) = device.links().iter().find(|l| l.id() == link_id) {
                if link.state().is_usable() && link.send_packet(packet).await.is_ok() {
                    return Ok(());
                }
            }
        }
        self.send_best(device_id, packet).await
    }

    async fn send_outbound(&mut self, device_id: &str, outbound: OutboundPacket) -> Result<()> {
        let device = self
            .devices
            .get(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;

        let links = device.links_by_priority();
        if links.is_empty() {
            return Err(ProtocolError::NoLinkAvailable(device_id.to_string()));
        }

        match outbound {
            OutboundPacket::Plain(packet) => {
                for link in &links {
                    match link.send_packet(&packet).await {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            warn!(
                                device_id,
                                link = %link.id(),
                                "Send failed, trying next link: {}",
                                e
                            );
                        }
                    }
                }
                Err(ProtocolError::NoLinkAvailable(device_id.to_string()))
            }
            OutboundPacket::WithPayload {
                packet,
                source,
                wait,
            } => {
                // The source is consumed by the first attempt; payload
                // sends do not fall through.
                links[0].send_packet_with_payload(packet, source, wait).await
            }
        }
    }

    fn emit_pairing(&self, event: PairingEvent) {
        let _ = self.event_tx.send(DeviceEvent::Pairing(event));
    }

    async fn shutdown(&mut self) {
        info!("Connection manager shutting down");

        let ids: Vec<String> = self.devices.devices().map(|d| d.id().to_string()).collect();
        for device_id in ids {
            if let Some(device) = self.devices.get_mut(&device_id) {
                device.close_all_links("shutting down").await;
                device.plugins.destroy_all().await;
            }
        }

        if let Err(e) = self.devices.save() {
            warn!("Device registry save failed during shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DeviceType;
    use crate::keystore::KeyStore;

    async fn manager() -> (ConnectionManager, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let keystore = KeyStore::load_or_create(dir.path(), "local_device").unwrap();
        let manager = ConnectionManager::start(
            Arc::new(RwLock::new(keystore)),
            PluginRegistry::with_builtins(),
            ConnectionConfig::default(),
        );
        (manager, dir)
    }

    #[tokio::test]
    async fn test_unknown_device_errors() {
        let (manager, _dir) = manager().await;
        let handle = manager.handle();

        let err = handle
            .send_packet("nobody", Packet::new("kdeconnect.ping", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::DeviceNotFound(_)));

        let err = handle.request_pair("nobody").await.unwrap_err();
        assert!(matches!(err, ProtocolError::DeviceNotFound(_)));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_snapshots_empty() {
        let (manager, _dir) = manager().await;
        assert!(manager.handle().devices().await.is_empty());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_persisted_devices_restored() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry_path = dir.path().join("devices.json");

        // First run: persist one reachable-but-unpaired device by
        // writing the registry directly.
        {
            let mut registry =
                crate::device::DeviceRegistry::with_persistence(&registry_path, 300);
            let info = DeviceInfo::with_id("peer_1", "Phone", DeviceType::Phone);
            let keystore = KeyStore::load_or_create(dir.path(), "local_device").unwrap();
            drop(keystore);

            let (tx, _rx) = mpsc::unbounded_channel();
            let flag = Arc::new(AtomicBool::new(false));
            let handle =
                DeviceHandle::new("peer_1".into(), "Phone".into(), flag.clone(), tx);
            let device = Device::new(
                info,
                PairingHandler::new("peer_1", PAIRING_TIMEOUT),
                DevicePlugins::new(handle),
                flag,
            );
            registry.insert(device);
            registry.save().unwrap();
        }

        let keystore = KeyStore::load_or_create(dir.path(), "local_device").unwrap();
        let manager = ConnectionManager::start(
            Arc::new(RwLock::new(keystore)),
            PluginRegistry::with_builtins(),
            ConnectionConfig {
                registry_path: Some(registry_path),
                ..Default::default()
            },
        );

        let snapshots = manager.handle().devices().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].device_id, "peer_1");
        assert!(!snapshots[0].is_paired);
        assert!(!snapshots[0].is_reachable);

        manager.shutdown().await;
    }
}
