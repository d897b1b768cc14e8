//! Trusted-Network Policy
//!
//! Gates discovery and connection acceptance on the identity of the
//! network the host is currently attached to. When the current network
//! is not trusted, the LAN provider suppresses identity broadcasts,
//! ignores inbound UDP identity packets and refuses inbound TCP
//! connections. Links that are already established stay up.

use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tracing::debug;

/// Source of the host's current network identity (SSID or an
/// equivalent token such as the gateway MAC)
///
/// Platform integrations implement this; the identity may be
/// unavailable (wired-only hosts, privacy-restricted platforms).
pub trait NetworkIdentitySource: Send + Sync {
    fn current_network(&self) -> Option<String>;
}

/// Identity source for hosts where the network cannot be determined
#[derive(Debug, Default)]
pub struct UnknownNetworkSource;

impl NetworkIdentitySource for UnknownNetworkSource {
    fn current_network(&self) -> Option<String> {
        None
    }
}

/// Fixed identity source, used by tests and single-network setups
#[derive(Debug)]
pub struct StaticNetworkSource(pub String);

impl NetworkIdentitySource for StaticNetworkSource {
    fn current_network(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Trusted-network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkPolicyConfig {
    /// Allow discovery and acceptance on every network
    pub trust_all_networks: bool,

    /// Network identifiers on which discovery and acceptance are
    /// allowed when `trust_all_networks` is false
    pub trusted_networks: Vec<String>,
}

impl Default for NetworkPolicyConfig {
    fn default() -> Self {
        Self {
            trust_all_networks: true,
            trusted_networks: Vec::new(),
        }
    }
}

/// Predicate over the current network identity
pub struct NetworkPolicy {
    config: RwLock<NetworkPolicyConfig>,
    source: Box<dyn NetworkIdentitySource>,
}

impl NetworkPolicy {
    pub fn new(config: NetworkPolicyConfig, source: Box<dyn NetworkIdentitySource>) -> Self {
        Self {
            config: RwLock::new(config),
            source,
        }
    }

    /// Policy that allows every network, with no identity source
    pub fn allow_all() -> Self {
        Self::new(
            NetworkPolicyConfig::default(),
            Box::new(UnknownNetworkSource),
        )
    }

    /// Whether discovery and acceptance are currently allowed
    pub fn allowed(&self) -> bool {
        let config = self.config.read().expect("network policy lock poisoned");
        if config.trust_all_networks {
            return true;
        }

        match self.source.current_network() {
            Some(network) => {
                let allowed = config.trusted_networks.iter().any(|n| n == &network);
                if !allowed {
                    debug!(network = %network, "Current network is not trusted");
                }
                allowed
            }
            // An unidentifiable network cannot be in the trusted set.
            None => false,
        }
    }

    /// Replace the configuration at runtime
    pub fn set_config(&self, config: NetworkPolicyConfig) {
        *self.config.write().expect("network policy lock poisoned") = config;
    }

    pub fn config(&self) -> NetworkPolicyConfig {
        self.config
            .read()
            .expect("network policy lock poisoned")
            .clone()
    }
}

impl std::fmt::Debug for NetworkPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkPolicy")
            .field("config", &self.config)
            .finish()
    }
}
