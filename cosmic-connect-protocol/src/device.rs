//! Device State Management
//!
//! Tracks every peer this installation knows about: its identity, the
//! set of links currently reaching it, its pair state machine and its
//! plugin instances.
//!
//! ## Lifecycle
//!
//! 1. **Discovery**: a device is inserted on first contact
//! 2. **Reachable**: at least one link is in a usable state
//! 3. **Paired**: the pair state machine reached `Paired` and the
//!    certificate is pinned
//! 4. **Removal**: only when the device is both unpaired and
//!    unreachable for a grace period
//!
//! The registry is the single owner of per-device state; every mutation
//! happens on the connection manager's dispatcher task.
//!
//! Known devices are persisted as JSON so paired devices survive
//! restarts.

use crate::discovery::DeviceInfo;
use crate::link::{DeviceLink, LinkId};
use crate::pairing::PairingHandler;
use crate::plugins::DevicePlugins;
use crate::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// How long an unpaired, unreachable device stays in the registry
pub const DEFAULT_REGISTRY_GRACE_SECS: u64 = 300;

/// One known peer
pub struct Device {
    pub info: DeviceInfo,

    /// Links in insertion order; outbound selection prefers priority
    links: Vec<Arc<dyn DeviceLink>>,

    pub pairing: PairingHandler,

    pub plugins: DevicePlugins,

    /// Shared with the plugin device handle
    paired_flag: Arc<AtomicBool>,

    /// Fingerprint of the certificate captured at the current session's
    /// TLS handshake
    pub session_fingerprint: Option<String>,

    /// UNIX timestamp of last activity
    pub last_seen: u64,
}

impl Device {
    pub fn new(
        info: DeviceInfo,
        pairing: PairingHandler,
        plugins: DevicePlugins,
        paired_flag: Arc<AtomicBool>,
    ) -> Self {
        paired_flag.store(pairing.is_paired(), Ordering::Release);
        Self {
            info,
            links: Vec::new(),
            pairing,
            plugins,
            paired_flag,
            session_fingerprint: None,
            last_seen: unix_now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.info.device_id
    }

    pub fn name(&self) -> &str {
        &self.info.device_name
    }

    pub fn is_paired(&self) -> bool {
        self.pairing.is_paired()
    }

    /// Keep the shared paired flag in sync with the state machine
    pub fn sync_paired_flag(&self) {
        self.paired_flag
            .store(self.pairing.is_paired(), Ordering::Release);
    }

    /// The flag shared with plugin device handles
    pub fn paired_flag(&self) -> Arc<AtomicBool> {
        self.paired_flag.clone()
    }

    pub fn is_reachable(&self) -> bool {
        self.links.iter().any(|l| l.state().is_usable())
    }

    pub fn touch(&mut self) {
        self.last_seen = unix_now();
    }

    pub fn seconds_since_last_seen(&self) -> u64 {
        unix_now().saturating_sub(self.last_seen)
    }

    /// Append a link; returns true when this made the device reachable
    pub fn add_link(&mut self, link: Arc<dyn DeviceLink>) -> bool {
        let was_reachable = self.is_reachable();
        info!(
            device_id = %self.id(),
            link = %link.id(),
            medium = link.medium().as_str(),
            "Link added"
        );
        self.links.push(link);
        self.touch();
        !was_reachable
    }

    /// Remove a link; returns true when the device became unreachable
    pub fn remove_link(&mut self, link_id: LinkId) -> bool {
        let before = self.links.len();
        self.links.retain(|l| l.id() != link_id);
        if self.links.len() != before {
            debug!(device_id = %self.id(), link = %link_id, "Link removed");
        }
        !self.is_reachable()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Usable links, highest priority first, insertion order preserved
    /// within one priority
    pub fn links_by_priority(&self) -> Vec<Arc<dyn DeviceLink>> {
        let mut usable: Vec<_> = self
            .links
            .iter()
            .filter(|l| l.state().is_usable())
            .cloned()
            .collect();
        usable.sort_by_key(|l| std::cmp::Reverse(l.priority()));
        usable
    }

    pub fn links(&self) -> &[Arc<dyn DeviceLink>] {
        &self.links
    }

    /// Close every link
    pub async fn close_all_links(&mut self, reason: &str) {
        for link in self.links.drain(..) {
            link.close(reason).await;
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("device_id", &self.info.device_id)
            .field("device_name", &self.info.device_name)
            .field("links", &self.links.len())
            .field("pair_state", &self.pairing.state())
            .finish()
    }
}

/// Read-only view of a device for observers outside the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub device_name: String,
    pub device_type: String,
    pub is_reachable: bool,
    pub is_paired: bool,
    pub last_seen: u64,
}

impl From<&Device> for DeviceSnapshot {
    fn from(device: &Device) -> Self {
        Self {
            device_id: device.info.device_id.clone(),
            device_name: device.info.device_name.clone(),
            device_type: device.info.device_type.as_str().to_string(),
            is_reachable: device.is_reachable(),
            is_paired: device.is_paired(),
            last_seen: device.last_seen,
        }
    }
}

/// Disk form of a known device
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedDevice {
    info: DeviceInfo,
    paired: bool,
    last_seen: u64,
}

/// The single owner of per-device state
pub struct DeviceRegistry {
    devices: HashMap<String, Device>,
    registry_path: Option<PathBuf>,
    grace_secs: u64,
}

impl DeviceRegistry {
    /// In-memory registry (tests, ephemeral daemons)
    pub fn ephemeral() -> Self {
        Self {
            devices: HashMap::new(),
            registry_path: None,
            grace_secs: DEFAULT_REGISTRY_GRACE_SECS,
        }
    }

    /// Registry persisted at `path`
    pub fn with_persistence(path: impl Into<PathBuf>, grace_secs: u64) -> Self {
        Self {
            devices: HashMap::new(),
            registry_path: Some(path.into()),
            grace_secs,
        }
    }

    pub fn get(&self, device_id: &str) -> Option<&Device> {
        self.devices.get(device_id)
    }

    pub fn get_mut(&mut self, device_id: &str) -> Option<&mut Device> {
        self.devices.get_mut(device_id)
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    pub fn insert(&mut self, device: Device) {
        info!(
            device_id = %device.id(),
            device_name = %device.name(),
            "Device registered"
        );
        self.devices.insert(device.id().to_string(), device);
    }

    pub fn remove(&mut self, device_id: &str) -> Option<Device> {
        let removed = self.devices.remove(device_id);
        if removed.is_some() {
            info!(device_id, "Device removed from registry");
        }
        removed
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn devices_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices.values_mut()
    }

    pub fn reachable(&self) -> impl Iterator<Item = &Device> {
        self.devices.values().filter(|d| d.is_reachable())
    }

    pub fn paired(&self) -> impl Iterator<Item = &Device> {
        self.devices.values().filter(|d| d.is_paired())
    }

    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        self.devices.values().map(DeviceSnapshot::from).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Drop devices that are unpaired and unreachable past the grace
    /// period; returns how many were removed
    pub fn cleanup_stale(&mut self) -> usize {
        let grace = self.grace_secs;
        let before = self.devices.len();
        self.devices.retain(|id, device| {
            let keep = device.is_paired()
                || device.is_reachable()
                || device.seconds_since_last_seen() < grace;
            if !keep {
                debug!(device_id = %id, "Dropping stale device");
            }
            keep
        });
        before - self.devices.len()
    }

    /// Persist known devices (no-op for ephemeral registries)
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.registry_path else {
            return Ok(());
        };

        let persisted: HashMap<&str, PersistedDevice> = self
            .devices
            .values()
            .map(|d| {
                (
                    d.id(),
                    PersistedDevice {
                        info: d.info.clone(),
                        paired: d.is_paired(),
                        last_seen: d.last_seen,
                    },
                )
            })
            .collect();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&persisted)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        debug!("Saved {} devices to registry", persisted.len());
        Ok(())
    }

    /// Load known devices from disk
    ///
    /// Returns the persisted records; the caller rebuilds live `Device`
    /// entries from them (pairing handlers need the key store's trust
    /// state, which the registry does not own).
    pub fn load_persisted(&self) -> Result<Vec<(DeviceInfo, bool, u64)>> {
        let Some(path) = &self.registry_path else {
            return Ok(Vec::new());
        };
        if !path.exists() {
            return Ok(Vec::new());
        }

        let json = fs::read_to_string(path)?;
        let persisted: HashMap<String, PersistedDevice> =
            serde_json::from_str(&json).map_err(|e| {
                warn!("Device registry unreadable: {}", e);
                ProtocolError::Json(e)
            })?;

        Ok(persisted
            .into_values()
            .map(|p| (p.info, p.paired, p.last_seen))
            .collect())
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.devices.len())
            .finish()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DeviceType;
    use crate::pairing::{PairingHandler, PAIRING_TIMEOUT};
    use crate::plugins::{DeviceHandle, DevicePlugins};
    use tokio::sync::mpsc;

    fn test_device(id: &str, paired: bool) -> Device {
        let info = DeviceInfo::with_id(id, "Test Device", DeviceType::Phone);
        let paired_flag = Arc::new(AtomicBool::new(false));
        // Tests never send through the handle, so the receiver can go.
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = DeviceHandle::new(
            id.to_string(),
            "Test Device".to_string(),
            paired_flag.clone(),
            tx,
        );
        let pairing = if paired {
            PairingHandler::new_paired(id, PAIRING_TIMEOUT)
        } else {
            PairingHandler::new(id, PAIRING_TIMEOUT)
        };
        Device::new(info, pairing, DevicePlugins::new(handle), paired_flag)
    }

    #[test]
    fn test_unreachable_without_links() {
        let device = test_device("dev_1", false);
        assert!(!device.is_reachable());
        assert_eq!(device.link_count(), 0);
    }

    #[test]
    fn test_registry_insert_and_lookup() {
        let mut registry = DeviceRegistry::ephemeral();
        registry.insert(test_device("dev_1", false));

        assert!(registry.contains("dev_1"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("dev_1").unwrap().name(), "Test Device");
        assert!(registry.get("dev_2").is_none());
    }

    #[test]
    fn test_cleanup_keeps_paired_devices() {
        let mut registry = DeviceRegistry::ephemeral();
        registry.grace_secs = 0;

        let mut stale = test_device("stale", false);
        stale.last_seen = 0;
        registry.insert(stale);

        let mut paired = test_device("paired", true);
        paired.last_seen = 0;
        registry.insert(paired);

        let removed = registry.cleanup_stale();
        assert_eq!(removed, 1);
        assert!(registry.contains("paired"));
        assert!(!registry.contains("stale"));
    }

    #[test]
    fn test_snapshots() {
        let mut registry = DeviceRegistry::ephemeral();
        registry.insert(test_device("dev_1", true));

        let snapshots = registry.snapshots();
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].is_paired);
        assert!(!snapshots[0].is_reachable);
        assert_eq!(snapshots[0].device_type, "phone");
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("devices.json");

        {
            let mut registry = DeviceRegistry::with_persistence(&path, 300);
            registry.insert(test_device("dev_1", true));
            registry.save().unwrap();
        }

        let registry = DeviceRegistry::with_persistence(&path, 300);
        let persisted = registry.load_persisted().unwrap();
        assert_eq!(persisted.len(), 1);
        let (info, paired, _) = &persisted[0];
        assert_eq!(info.device_id, "dev_1");
        assert!(paired);
    }
}
