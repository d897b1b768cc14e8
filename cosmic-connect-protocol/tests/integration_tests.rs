//! End-to-end tests over loopback: link setup, pairing, dispatch,
//! payload transfer, identity pinning and URL validation, with two
//! full protocol stacks talking to each other.

use async_trait::async_trait;
use cosmic_connect_protocol::connection::{
    ConnectionConfig, ConnectionHandle, ConnectionManager, DeviceEvent,
};
use cosmic_connect_protocol::discovery::{DeviceInfo, DeviceType};
use cosmic_connect_protocol::keystore::KeyStore;
use cosmic_connect_protocol::link::lan::{LanLinkProvider, LanProviderConfig};
use cosmic_connect_protocol::pairing::PairingEvent;
use cosmic_connect_protocol::payload::{Payload, PayloadSource};
use cosmic_connect_protocol::plugins::{
    DeviceHandle, Plugin, PluginDescriptor, PluginRegistration, PluginRegistry,
};
use cosmic_connect_protocol::policy::NetworkPolicy;
use cosmic_connect_protocol::tls::TlsConfig;
use cosmic_connect_protocol::urlcheck;
use cosmic_connect_protocol::{Packet, Result};
use once_cell::sync::Lazy;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{sleep, timeout};

/// Everything the probe plugin saw, across all stacks in the process.
/// Entries carry the peer's device id, so tests (which use unique ids)
/// can filter out their own traffic.
static RECORDED: Lazy<StdMutex<Vec<ProbeRecord>>> = Lazy::new(|| StdMutex::new(Vec::new()));

#[derive(Debug, Clone)]
struct ProbeRecord {
    peer_device_id: String,
    packet_id: i64,
    packet_type: String,
    message: Option<String>,
    payload: Option<Vec<u8>>,
}

static PROBE_DESCRIPTOR: PluginDescriptor = PluginDescriptor {
    key: "probe",
    display_name: "Probe",
    description: "Records every dispatched packet for assertions",
    incoming: &["kdeconnect.ping", "kdeconnect.share.request"],
    outgoing: &["kdeconnect.ping", "kdeconnect.share.request"],
    enabled_by_default: true,
    listen_to_unpaired: false,
    permissions: &[],
};

struct ProbePlugin;

#[async_trait]
impl Plugin for ProbePlugin {
    fn descriptor(&self) -> &'static PluginDescriptor {
        &PROBE_DESCRIPTOR
    }

    async fn create(&mut self, _device: &DeviceHandle) -> Result<()> {
        Ok(())
    }

    async fn handle_packet(
        &mut self,
        packet: &Packet,
        payload: Option<Payload>,
        device: &DeviceHandle,
    ) -> Result<bool> {
        let payload = match payload {
            Some(p) => Some(p.read_all().await?),
            None => None,
        };

        RECORDED.lock().unwrap().push(ProbeRecord {
            peer_device_id: device.device_id().to_string(),
            packet_id: packet.id,
            packet_type: packet.packet_type.clone(),
            message: packet.get_body_field::<String>("message"),
            payload,
        });
        Ok(true)
    }

    async fn destroy(&mut self) {}
}

fn probe_registry() -> PluginRegistry {
    PluginRegistry::new(vec![PluginRegistration {
        descriptor: &PROBE_DESCRIPTOR,
        constructor: || Box::new(ProbePlugin),
    }])
}

fn records_from(peer: &str) -> Vec<ProbeRecord> {
    RECORDED
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.peer_device_id == peer)
        .cloned()
        .collect()
}

struct Stack {
    device_id: String,
    handle: ConnectionHandle,
    events: mpsc::UnboundedReceiver<DeviceEvent>,
    provider: Arc<LanLinkProvider>,
    keystore: Arc<RwLock<KeyStore>>,
    port: u16,
    manager: ConnectionManager,
    _dir: TempDir,
}

async fn stack(device_id: &str, pairing_timeout: Duration) -> Stack {
    let dir = TempDir::new().unwrap();
    let keystore = Arc::new(RwLock::new(
        KeyStore::load_or_create(dir.path().join("keys"), device_id).unwrap(),
    ));
    let identity = keystore.read().await.local().clone();

    let registry = probe_registry();
    let incoming = registry.incoming_capabilities();
    let outgoing = registry.outgoing_capabilities();

    let mut manager = ConnectionManager::start(
        keystore.clone(),
        registry,
        ConnectionConfig {
            pairing_timeout,
            registry_path: None,
            ..Default::default()
        },
    );
    let events = manager.take_events().unwrap();

    let info = DeviceInfo::with_id(device_id, device_id, DeviceType::Desktop)
        .with_incoming_capabilities(incoming)
        .with_outgoing_capabilities(outgoing);

    let provider = Arc::new(LanLinkProvider::new(
        info,
        Arc::new(TlsConfig::new(identity)),
        keystore.clone(),
        Arc::new(NetworkPolicy::allow_all()),
        manager.link_event_sender(),
        LanProviderConfig {
            // Port 0 binds an ephemeral port, keeping parallel tests
            // off each other's sockets.
            tcp_port: 0,
            ..Default::default()
        },
    ));
    let port = provider.start_listener().await.unwrap();

    Stack {
        device_id: device_id.to_string(),
        handle: manager.handle(),
        events,
        provider,
        keystore,
        port,
        manager,
        _dir: dir,
    }
}

fn loopback(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

/// Wait until the event stream produces something matching `pred`
async fn wait_for_event(
    events: &mut mpsc::UnboundedReceiver<DeviceEvent>,
    what: &str,
    mut pred: impl FnMut(&DeviceEvent) -> bool,
) -> DeviceEvent {
    timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
}

async fn connect(a: &mut Stack, b: &mut Stack) {
    a.provider.connect_addr(loopback(b.port)).await.unwrap();

    wait_for_event(&mut a.events, "A sees B reachable", |e| {
        matches!(e, DeviceEvent::Reachable { device_id, .. } if *device_id == b.device_id)
    })
    .await;
    wait_for_event(&mut b.events, "B sees A reachable", |e| {
        matches!(e, DeviceEvent::Reachable { device_id, .. } if *device_id == a.device_id)
    })
    .await;
}

async fn pair(a: &mut Stack, b: &mut Stack) {
    a.handle.request_pair(&b.device_id).await.unwrap();

    wait_for_event(&mut b.events, "B sees pairing request", |e| {
        matches!(
            e,
            DeviceEvent::Pairing(PairingEvent::RequestReceived { device_id, .. })
                if *device_id == a.device_id
        )
    })
    .await;

    b.handle.accept_pair(&a.device_id).await.unwrap();

    wait_for_event(&mut a.events, "A paired", |e| {
        matches!(
            e,
            DeviceEvent::Pairing(PairingEvent::Paired { device_id }) if *device_id == b.device_id
        )
    })
    .await;
}

#[tokio::test]
async fn test_discover_and_identify() {
    let mut a = stack("it_ident_a", Duration::from_secs(30)).await;
    let mut b = stack("it_ident_b", Duration::from_secs(30)).await;

    connect(&mut a, &mut b).await;

    // Both registries contain the other, reachable and unpaired.
    let a_devices = a.handle.devices().await;
    assert_eq!(a_devices.len(), 1);
    assert_eq!(a_devices[0].device_id, b.device_id);
    assert!(a_devices[0].is_reachable);
    assert!(!a_devices[0].is_paired);

    let b_devices = b.handle.devices().await;
    assert_eq!(b_devices.len(), 1);
    assert_eq!(b_devices[0].device_id, a.device_id);
    assert!(b_devices[0].is_reachable);
    assert!(!b_devices[0].is_paired);

    a.manager.shutdown().await;
    b.manager.shutdown().await;
}

#[tokio::test]
async fn test_pairing_accepted() {
    let mut a = stack("it_pair_a", Duration::from_secs(30)).await;
    let mut b = stack("it_pair_b", Duration::from_secs(30)).await;

    connect(&mut a, &mut b).await;
    pair(&mut a, &mut b).await;

    // Both key stores hold the peer certificate, trusted.
    {
        let ks = a.keystore.read().await;
        assert!(ks.is_trusted(&b.device_id));
        assert!(ks.peer_certificate(&b.device_id).is_some());
    }
    {
        let ks = b.keystore.read().await;
        assert!(ks.is_trusted(&a.device_id));
        assert!(ks.peer_certificate(&a.device_id).is_some());
    }

    // The stored fingerprint equals the one presented on the session.
    let b_fp_stored = a.keystore.read().await.peer_fingerprint(&b.device_id);
    let b_fp_actual = b.keystore.read().await.local().fingerprint.clone();
    assert_eq!(b_fp_stored.as_deref(), Some(b_fp_actual.as_str()));

    assert!(a.handle.devices().await[0].is_paired);
    assert!(b.handle.devices().await[0].is_paired);

    a.manager.shutdown().await;
    b.manager.shutdown().await;
}

#[tokio::test]
async fn test_pairing_timeout() {
    let mut a = stack("it_timeout_a", Duration::from_secs(1)).await;
    let mut b = stack("it_timeout_b", Duration::from_secs(1)).await;

    connect(&mut a, &mut b).await;

    a.handle.request_pair(&b.device_id).await.unwrap();

    // B takes no action; A falls back to unpaired with a timeout event.
    wait_for_event(&mut a.events, "A pairing timeout", |e| {
        matches!(
            e,
            DeviceEvent::Pairing(PairingEvent::Timeout { device_id }) if *device_id == b.device_id
        )
    })
    .await;

    assert!(!a.handle.devices().await[0].is_paired);
    assert!(!a.keystore.read().await.is_trusted(&b.device_id));

    a.manager.shutdown().await;
    b.manager.shutdown().await;
}

#[tokio::test]
async fn test_pairing_rejected() {
    let mut a = stack("it_reject_a", Duration::from_secs(30)).await;
    let mut b = stack("it_reject_b", Duration::from_secs(30)).await;

    connect(&mut a, &mut b).await;

    a.handle.request_pair(&b.device_id).await.unwrap();
    wait_for_event(&mut b.events, "B sees pairing request", |e| {
        matches!(
            e,
            DeviceEvent::Pairing(PairingEvent::RequestReceived { device_id, .. })
                if *device_id == a.device_id
        )
    })
    .await;

    b.handle.reject_pair(&a.device_id).await.unwrap();

    wait_for_event(&mut a.events, "A sees rejection", |e| {
        matches!(
            e,
            DeviceEvent::Pairing(PairingEvent::Rejected { device_id, .. })
                if *device_id == b.device_id
        )
    })
    .await;

    assert!(!a.handle.devices().await[0].is_paired);
    assert!(!b.keystore.read().await.is_trusted(&a.device_id));

    a.manager.shutdown().await;
    b.manager.shutdown().await;
}

#[tokio::test]
async fn test_ping_round_trip() {
    let mut a = stack("it_ping_a", Duration::from_secs(30)).await;
    let mut b = stack("it_ping_b", Duration::from_secs(30)).await;

    connect(&mut a, &mut b).await;
    pair(&mut a, &mut b).await;

    let packet = Packet::with_id(12345, "kdeconnect.ping", json!({"message": "hello"}));
    a.handle.send_packet(&b.device_id, packet).await.unwrap();
    for id in [12346, 12347] {
        let packet = Packet::with_id(id, "kdeconnect.ping", json!({}));
        a.handle.send_packet(&b.device_id, packet).await.unwrap();
    }

    // B's dispatcher hands the packets to the plugin with bodies
    // intact and in submission order.
    let records = timeout(Duration::from_secs(10), async {
        loop {
            let records = records_from(&a.device_id);
            if records.len() >= 3 {
                return records;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("pings never dispatched");

    assert_eq!(
        records.iter().map(|r| r.packet_id).collect::<Vec<_>>(),
        vec![12345, 12346, 12347]
    );
    assert_eq!(records[0].packet_type, "kdeconnect.ping");
    assert_eq!(records[0].message.as_deref(), Some("hello"));
    assert!(records[0].payload.is_none());

    a.manager.shutdown().await;
    b.manager.shutdown().await;
}

#[tokio::test]
async fn test_file_transfer() {
    let mut a = stack("it_share_a", Duration::from_secs(30)).await;
    let mut b = stack("it_share_b", Duration::from_secs(30)).await;

    connect(&mut a, &mut b).await;
    pair(&mut a, &mut b).await;

    let packet = Packet::new(
        "kdeconnect.share.request",
        json!({"filename": "a.txt", "numberOfFiles": 1, "totalPayloadSize": 11}),
    );
    a.handle
        .send_packet_with_payload(
            &b.device_id,
            packet,
            PayloadSource::from_bytes(b"hello world".to_vec()),
            false,
        )
        .await
        .unwrap();

    let record = timeout(Duration::from_secs(10), async {
        loop {
            if let Some(r) = records_from(&a.device_id)
                .into_iter()
                .find(|r| r.packet_type.ends_with("share.request"))
            {
                return r;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("share never dispatched");

    // Exactly the declared bytes arrive on the side-channel.
    assert_eq!(record.payload.as_deref(), Some(&b"hello world"[..]));

    a.manager.shutdown().await;
    b.manager.shutdown().await;
}

#[tokio::test]
async fn test_unpaired_packets_discarded() {
    let mut a = stack("it_discard_a", Duration::from_secs(30)).await;
    let mut b = stack("it_discard_b", Duration::from_secs(30)).await;

    connect(&mut a, &mut b).await;
    pair(&mut a, &mut b).await;

    // B unpairs; A observes it.
    b.handle.unpair(&a.device_id).await.unwrap();
    wait_for_event(&mut a.events, "A sees remote unpair", |e| {
        matches!(
            e,
            DeviceEvent::Pairing(PairingEvent::Unpaired { device_id, by_peer: true })
                if *device_id == b.device_id
        )
    })
    .await;

    let before = records_from(&a.device_id).len();

    // A still believes nothing is wrong with sending; B must discard.
    let packet = Packet::new("kdeconnect.ping", json!({"message": "stale"}));
    let _ = a.handle.send_packet(&b.device_id, packet).await;

    sleep(Duration::from_millis(500)).await;
    assert_eq!(
        records_from(&a.device_id).len(),
        before,
        "packet from unpaired device must not reach plugins"
    );
    assert!(!b.handle.devices().await[0].is_paired);

    a.manager.shutdown().await;
    b.manager.shutdown().await;
}

#[tokio::test]
async fn test_identity_mismatch_after_trust() {
    let mut a = stack("it_mismatch_a", Duration::from_secs(30)).await;
    let mut b = stack("it_mismatch_b", Duration::from_secs(30)).await;

    connect(&mut a, &mut b).await;
    pair(&mut a, &mut b).await;

    let old_fingerprint = b.keystore.read().await.peer_fingerprint(&a.device_id);
    a.manager.shutdown().await;

    // The same device id returns with a regenerated certificate.
    let a2 = stack("it_mismatch_a", Duration::from_secs(30)).await;
    let new_fingerprint = a2.keystore.read().await.local().fingerprint.clone();
    assert_ne!(old_fingerprint.as_deref(), Some(new_fingerprint.as_str()));

    // B pins the old certificate, so the handshake must fail.
    let result = a2.provider.connect_addr(loopback(b.port)).await;
    assert!(result.is_err(), "link with a changed certificate must fail");

    // Stored trust is not auto-refreshed.
    assert_eq!(
        b.keystore.read().await.peer_fingerprint(&a.device_id),
        old_fingerprint
    );
    assert!(b.keystore.read().await.is_trusted(&a.device_id));

    a2.manager.shutdown().await;
    b.manager.shutdown().await;
}

#[test]
fn test_url_validation() {
    // A cloud metadata endpoint is refused with an SSRF-referencing
    // code and a reason naming the metadata address.
    let rejection = urlcheck::validate("http://169.254.169.254/latest/meta-data/").unwrap_err();
    assert_eq!(rejection.code, urlcheck::UrlErrorCode::SsrfBlockedHost);
    assert!(rejection.reason.contains("SSRF"));
    assert!(rejection.reason.contains("metadata"));
    assert_eq!(
        urlcheck::sanitize("http://169.254.169.254/latest/meta-data/"),
        None
    );

    // An ordinary public URL passes and sanitizes to itself.
    assert!(urlcheck::validate("https://example.com/path?q=1").is_ok());
    assert_eq!(
        urlcheck::sanitize("https://example.com/path?q=1"),
        Some("https://example.com/path?q=1".to_string())
    );
}

#[tokio::test]
async fn test_disconnect_makes_unreachable() {
    let mut a = stack("it_close_a", Duration::from_secs(30)).await;
    let mut b = stack("it_close_b", Duration::from_secs(30)).await;

    connect(&mut a, &mut b).await;

    a.handle.disconnect(&b.device_id).await.unwrap();

    wait_for_event(&mut b.events, "B sees A unreachable", |e| {
        matches!(e, DeviceEvent::Unreachable { device_id } if *device_id == a.device_id)
    })
    .await;

    a.manager.shutdown().await;
    b.manager.shutdown().await;
}
