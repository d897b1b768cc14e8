//! COSMIC Connect daemon
//!
//! Builds the protocol context (key store, plugin registry, connection
//! manager, LAN link provider), starts discovery and serves until
//! interrupted. Pairing consent arrives over the event stream; without
//! a frontend attached the daemon logs requests (or accepts them when
//! `auto_accept_pairing` is set, which is meant for test setups).

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use cosmic_connect_protocol::{
    ConnectionConfig, ConnectionHandle, ConnectionManager, DeviceEvent, DeviceInfo, DeviceType,
    KeyStore, LanLinkProvider, LanProviderConfig, LinkProvider, NetworkPolicy, PairingEvent,
    PluginRegistry, TlsConfig,
};
use cosmic_connect_protocol::keystore::format_fingerprint;
use cosmic_connect_protocol::policy::UnknownNetworkSource;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cosmic-connect-daemon", about = "COSMIC Connect background daemon")]
struct Cli {
    /// Configuration file (default: ~/.config/cosmic-connect/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print known devices on startup and whenever they change
    #[arg(long)]
    watch_devices: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::default_path()?,
    };
    let mut config = Config::load_or_create(&config_path)?;
    let device_id = config.device_id(&config_path)?;

    let data_dir = config.data_dir()?;
    info!(
        device_id = %device_id,
        data_dir = %data_dir.display(),
        "Starting COSMIC Connect daemon"
    );

    // One local key pair and certificate, shared by the primary
    // transport and every payload side-channel.
    let keystore = KeyStore::load_or_create(data_dir.join("keys"), &device_id)
        .context("opening key store")?;
    info!(
        fingerprint = %format_fingerprint(keystore.fingerprint()),
        "Device certificate ready"
    );
    let identity = keystore.local().clone();
    let keystore = Arc::new(RwLock::new(keystore));

    let download_dir = config.download_dir();
    cosmic_connect_protocol::plugins::share::set_default_download_dir(&download_dir);
    info!(download_dir = %download_dir.display(), "Receiving shared files");

    let mut plugin_registry = PluginRegistry::with_builtins();
    for key in &config.plugins.disabled {
        plugin_registry.set_enabled(key, false);
        info!(plugin = %key, "Plugin disabled by configuration");
    }
    let incoming = plugin_registry.incoming_capabilities();
    let outgoing = plugin_registry.outgoing_capabilities();

    let mut manager = ConnectionManager::start(
        keystore.clone(),
        plugin_registry,
        ConnectionConfig {
            registry_path: Some(data_dir.join("devices.json")),
            ..Default::default()
        },
    );
    let events = manager.take_events().expect("fresh manager");

    let device_type = DeviceType::from_str_opt(&config.device.device_type).unwrap_or_else(|| {
        warn!(
            "Unknown device type '{}', using desktop",
            config.device.device_type
        );
        DeviceType::Desktop
    });
    let device_info = DeviceInfo::with_id(&device_id, &config.device.name, device_type)
        .with_incoming_capabilities(incoming)
        .with_outgoing_capabilities(outgoing);

    let policy = Arc::new(NetworkPolicy::new(
        config.policy.clone(),
        Box::new(UnknownNetworkSource),
    ));

    let provider = Arc::new(LanLinkProvider::new(
        device_info,
        Arc::new(TlsConfig::new(identity)),
        keystore.clone(),
        policy,
        manager.link_event_sender(),
        LanProviderConfig {
            tcp_port: config.network.tcp_port,
            broadcast_interval: Duration::from_secs(config.network.broadcast_interval_secs),
            ..Default::default()
        },
    ));

    let tcp_port = if config.network.disable_discovery {
        provider.start_listener().await?
    } else {
        provider.start_lan().await?
    };
    info!(tcp_port, "LAN provider started");

    let handle = manager.handle();
    let event_task = tokio::spawn(run_event_loop(
        events,
        handle.clone(),
        config.plugins.auto_accept_pairing,
        cli.watch_devices,
    ));

    tokio::signal::ctrl_c().await.context("waiting for SIGINT")?;
    info!("Shutting down");

    // Two-phase drain: stop producing links, then close the ones that
    // exist and tear down plugin instances.
    provider.stop().await;
    manager.shutdown().await;
    event_task.abort();

    info!("Goodbye");
    Ok(())
}

fn init_logging(verbosity: u8) {
    let default = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Consume device events: log them and answer pairing requests
async fn run_event_loop(
    mut events: mpsc::UnboundedReceiver<DeviceEvent>,
    handle: ConnectionHandle,
    auto_accept_pairing: bool,
    watch_devices: bool,
) {
    while let Some(event) = events.recv().await {
        match event {
            DeviceEvent::Reachable { device_id, info } => {
                info!(
                    device_id = %device_id,
                    device_name = %info.device_name,
                    device_type = info.device_type.as_str(),
                    "Device reachable"
                );
                if watch_devices {
                    print_devices(&handle).await;
                }
            }
            DeviceEvent::Unreachable { device_id } => {
                info!(device_id = %device_id, "Device unreachable");
                if watch_devices {
                    print_devices(&handle).await;
                }
            }
            DeviceEvent::Pairing(pairing) => {
                handle_pairing_event(&handle, pairing, auto_accept_pairing).await;
            }
        }
    }
}

async fn handle_pairing_event(
    handle: &ConnectionHandle,
    event: PairingEvent,
    auto_accept: bool,
) {
    match event {
        PairingEvent::RequestReceived {
            device_id,
            device_name,
            their_fingerprint,
        } => {
            info!(
                device_id = %device_id,
                device_name = %device_name,
                fingerprint = %format_fingerprint(&their_fingerprint),
                "Pairing requested; verify the fingerprint on both devices"
            );
            if auto_accept {
                warn!(device_id = %device_id, "Auto-accepting pairing (test configuration)");
                if let Err(e) = handle.accept_pair(&device_id).await {
                    error!(device_id = %device_id, "Auto-accept failed: {}", e);
                }
            }
        }
        PairingEvent::RequestSent {
            device_id,
            our_fingerprint,
        } => {
            info!(
                device_id = %device_id,
                fingerprint = %format_fingerprint(&our_fingerprint),
                "Pairing request sent"
            );
        }
        PairingEvent::Paired { device_id } => {
            info!(device_id = %device_id, "Paired");
        }
        PairingEvent::Rejected { device_id, reason } => {
            info!(
                device_id = %device_id,
                reason = reason.as_deref().unwrap_or("none given"),
                "Pairing rejected"
            );
        }
        PairingEvent::Unpaired { device_id, by_peer } => {
            info!(device_id = %device_id, by_peer, "Unpaired");
        }
        PairingEvent::Timeout { device_id } => {
            info!(device_id = %device_id, "Pairing timed out");
        }
    }
}

async fn print_devices(handle: &ConnectionHandle) {
    let devices = handle.devices().await;
    if devices.is_empty() {
        debug!("No known devices");
        return;
    }
    for device in devices {
        info!(
            device_id = %device.device_id,
            device_name = %device.device_name,
            reachable = device.is_reachable,
            paired = device.is_paired,
            "Known device"
        );
    }
}
