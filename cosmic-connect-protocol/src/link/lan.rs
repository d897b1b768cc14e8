//! LAN Link Provider
//!
//! The primary transport: UDP identity discovery plus TLS over TCP.
//!
//! ## Link setup sequence
//!
//! Symmetric once the socket is open:
//!
//! 1. Both sides send their identity packet as a single line over the
//!    plain TCP stream; this is the only plaintext frame in the lifetime of
//!    the connection.
//! 2. The socket is upgraded to TLS. The side that initiated the TCP
//!    connection takes the TLS client role.
//! 3. The peer's presented certificate is validated (CN = device id;
//!    fingerprint pinned for trusted peers), `Identified` is emitted
//!    and the receive loop starts.
//!
//! Inbound connections and UDP identity packets are refused while the
//! trusted-network policy disallows the current network.

use crate::discovery::{DeviceInfo, DiscoveryEvent, UdpDiscovery, DISCOVERY_PORT};
use crate::keystore::KeyStore;
use crate::link::{DeviceLink, LinkEvent, LinkId, LinkMedium, LinkProvider, LinkState};
use crate::packet::DEFAULT_MAX_FRAME_LEN;
use crate::payload::{Payload, PayloadSource, PayloadUpload};
use crate::policy::NetworkPolicy;
use crate::tls::{verify_peer_identity, TlsConfig};
use crate::{Packet, ProtocolError, Result};
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::{debug, error, info, warn};

/// Priority of LAN links; alternative transports use lower values
pub const LAN_LINK_PRIORITY: i32 = 100;

/// Timeout for the plaintext identity exchange and TLS upgrade
const SETUP_TIMEOUT: Duration = Duration::from_secs(15);

/// LAN provider configuration
#[derive(Debug, Clone)]
pub struct LanProviderConfig {
    /// Preferred TCP listen port; the provider walks forward from here
    /// when the port is taken
    pub tcp_port: u16,

    /// Interval between identity broadcasts
    pub broadcast_interval: Duration,

    /// Hard cap on a single frame
    pub max_frame_len: usize,
}

impl Default for LanProviderConfig {
    fn default() -> Self {
        Self {
            // Adjacent to the UDP discovery port.
            tcp_port: DISCOVERY_PORT + 1,
            broadcast_interval: crate::discovery::DEFAULT_BROADCAST_INTERVAL,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Link provider for the local network
pub struct LanLinkProvider {
    device_info: RwLock<DeviceInfo>,
    tls: Arc<TlsConfig>,
    keystore: Arc<RwLock<KeyStore>>,
    policy: Arc<NetworkPolicy>,
    events: mpsc::UnboundedSender<LinkEvent>,
    config: LanProviderConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Devices with a connect attempt in flight, to keep repeated
    /// broadcasts from opening duplicate sockets
    connecting: Arc<StdMutex<HashSet<String>>>,
}

impl LanLinkProvider {
    pub fn new(
        device_info: DeviceInfo,
        tls: Arc<TlsConfig>,
        keystore: Arc<RwLock<KeyStore>>,
        policy: Arc<NetworkPolicy>,
        events: mpsc::UnboundedSender<LinkEvent>,
        config: LanProviderConfig,
    ) -> Self {
        Self {
            device_info: RwLock::new(device_info),
            tls,
            keystore,
            policy,
            events,
            config,
            tasks: Mutex::new(Vec::new()),
            connecting: Arc::new(StdMutex::new(HashSet::new())),
        }
    }

    /// Our identity as currently announced (includes the TCP port once
    /// the provider has started)
    pub async fn device_info(&self) -> DeviceInfo {
        self.device_info.read().await.clone()
    }

    /// Bind the TCP listener, walking forward from the configured port
    async fn bind_listener(&self) -> Result<TcpListener> {
        let first = self.config.tcp_port;
        for port in first..first.saturating_add(50) {
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => {
                    info!("LAN provider listening on TCP port {}", port);
                    return Ok(listener);
                }
                Err(_) => continue,
            }
        }

        Err(ProtocolError::Io(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!("no TCP port available from {}", first),
        )))
    }

    /// Actively connect to a discovered device
    async fn connect_to(self: &Arc<Self>, info: DeviceInfo, addr: SocketAddr) {
        let Some(port) = info.tcp_port else {
            debug!(
                "Discovered {} without a TCP port, cannot connect",
                info.device_id
            );
            return;
        };

        {
            let mut connecting = self.connecting.lock().expect("connecting set poisoned");
            if !connecting.insert(info.device_id.clone()) {
                return;
            }
        }

        let provider = self.clone();
        let device_id = info.device_id.clone();
        let target = SocketAddr::new(addr.ip(), port);

        let handle = tokio::spawn(async move {
            if let Err(e) = provider.run_outbound(target).await {
                debug!("Outbound link to {} failed: {}", target, e);
            }
            provider
                .connecting
                .lock()
                .expect("connecting set poisoned")
                .remove(&device_id);
        });

        self.tasks.lock().await.push(handle);
    }

    /// Outbound setup: we initiated TCP, so we are the TLS client
    async fn run_outbound(self: &Arc<Self>, addr: SocketAddr) -> Result<()> {
        let mut stream = timeout(SETUP_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtocolError::Timeout(format!("connecting to {}", addr)))?
            .map_err(|e| ProtocolError::from_io_error(e, "TCP connect"))?;

        // Step 1: identities in plaintext, ours first.
        let our_identity = self.device_info.read().await.to_identity_packet();
        stream.write_all(&our_identity.to_bytes()?).await?;
        stream.flush().await?;

        let line = read_plaintext_line(&mut stream, self.config.max_frame_len).await?;
        let identity = Packet::from_bytes_with_limit(&line, self.config.max_frame_len)?;
        let info = DeviceInfo::from_identity_packet(&identity)?;
        self.reject_self(&info).await?;

        // Step 2: TLS upgrade as client, pinning the stored certificate
        // for a trusted peer.
        let (pinned, trusted) = self.pinned_certificate(&info.device_id).await;
        let client_config = self.tls.client_config(pinned.as_deref())?;
        let server_name = ServerName::try_from("cosmic-connect")
            .map_err(|e| ProtocolError::CertificateValidation(e.to_string()))?;

        let connector = TlsConnector::from(client_config);
        let tls_stream = timeout(SETUP_TIMEOUT, connector.connect(server_name, stream))
            .await
            .map_err(|_| ProtocolError::Timeout("TLS handshake".to_string()))?
            .map_err(|e| ProtocolError::Tls(rustls::Error::General(e.to_string())))?;

        let presented = tls_stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|c| c.as_ref().to_vec())
            .ok_or_else(|| {
                ProtocolError::CertificateValidation("peer presented no certificate".to_string())
            })?;

        self.finish_setup(TlsStream::Client(tls_stream), addr, info, presented, trusted)
            .await
    }

    /// Inbound setup: the peer initiated TCP, so we are the TLS server
    async fn run_inbound(self: &Arc<Self>, mut stream: TcpStream, addr: SocketAddr) -> Result<()> {
        // Step 1: the initiator's identity arrives first, then ours
        // goes out. Still plaintext.
        let line = read_plaintext_line(&mut stream, self.config.max_frame_len).await?;
        let identity = Packet::from_bytes_with_limit(&line, self.config.max_frame_len)?;
        let info = DeviceInfo::from_identity_packet(&identity)?;
        self.reject_self(&info).await?;

        let our_identity = self.device_info.read().await.to_identity_packet();
        stream.write_all(&our_identity.to_bytes()?).await?;
        stream.flush().await?;

        // Step 2: TLS upgrade as server. Client auth is requested from
        // everyone and required from trusted peers.
        let (pinned, trusted) = self.pinned_certificate(&info.device_id).await;
        let server_config = self.tls.server_config(pinned.as_deref(), trusted)?;

        let acceptor = TlsAcceptor::from(server_config);
        let tls_stream = timeout(SETUP_TIMEOUT, acceptor.accept(stream))
            .await
            .map_err(|_| ProtocolError::Timeout("TLS handshake".to_string()))?
            .map_err(|e| ProtocolError::Tls(rustls::Error::General(e.to_string())))?;

        let presented = tls_stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|c| c.as_ref().to_vec());

        let presented = match presented {
            Some(der) => der,
            None if trusted => {
                return Err(ProtocolError::CertificateValidation(
                    "trusted peer presented no certificate".to_string(),
                ))
            }
            None => {
                // An unpaired peer may omit the client certificate;
                // pairing will fail later without one, but identity
                // validation cannot proceed here.
                return Err(ProtocolError::CertificateValidation(
                    "peer presented no certificate".to_string(),
                ));
            }
        };

        self.finish_setup(TlsStream::Server(tls_stream), addr, info, presented, trusted)
            .await
    }

    /// Step 3, shared by both roles: validate the presented certificate
    /// and put the link into service
    async fn finish_setup(
        self: &Arc<Self>,
        stream: TlsStream<TcpStream>,
        addr: SocketAddr,
        info: DeviceInfo,
        presented: Vec<u8>,
        trusted: bool,
    ) -> Result<()> {
        let pinned_fingerprint = if trusted {
            self.keystore.read().await.peer_fingerprint(&info.device_id)
        } else {
            None
        };

        let fingerprint = verify_peer_identity(
            &presented,
            &info.device_id,
            pinned_fingerprint.as_deref(),
        )?;

        let (link, read_half) = LanLink::new(
            info.device_id.clone(),
            addr,
            stream,
            self.tls.clone(),
            presented.clone(),
            self.config.max_frame_len,
        );

        info!(
            device_id = %info.device_id,
            device_name = %info.device_name,
            %addr,
            "LAN link identified"
        );

        let _ = self.events.send(LinkEvent::Identified {
            link: link.clone() as Arc<dyn DeviceLink>,
            info,
            certificate: presented,
            fingerprint,
        });

        LanLink::spawn_receive_loop(link, read_half, self.events.clone());
        Ok(())
    }

    /// Refuse to link with our own announcements
    async fn reject_self(&self, info: &DeviceInfo) -> Result<()> {
        if info.device_id == self.device_info.read().await.device_id {
            return Err(ProtocolError::InvalidPacket(
                "connection from our own device id".to_string(),
            ));
        }
        Ok(())
    }

    /// Stored certificate and trust flag for a peer
    async fn pinned_certificate(&self, device_id: &str) -> (Option<Vec<u8>>, bool) {
        let keystore = self.keystore.read().await;
        let trusted = keystore.is_trusted(device_id);
        let pinned = if trusted {
            keystore.peer_certificate(device_id).map(|c| c.to_vec())
        } else {
            None
        };
        (pinned, trusted)
    }
}

#[async_trait]
impl LinkProvider for LanLinkProvider {
    fn name(&self) -> &'static str {
        "lan"
    }

    fn priority(&self) -> i32 {
        LAN_LINK_PRIORITY
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        self.start_lan().await.map(|_| ())
    }

    async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        info!("LAN provider stopped");
    }
}

impl LanLinkProvider {
    /// Start the full provider: TCP acceptor, UDP discovery and the
    /// broadcast announcer. Returns the bound TCP port.
    pub async fn start_lan(self: &Arc<Self>) -> Result<u16> {
        let tcp_port = self.start_listener().await?;
        self.start_discovery().await?;
        Ok(tcp_port)
    }

    /// Bind the TCP listener and start accepting inbound connections
    ///
    /// Usable on its own when discovery is disabled (manual connects
    /// via [`connect_addr`](Self::connect_addr)).
    pub async fn start_listener(self: &Arc<Self>) -> Result<u16> {
        let listener = self.bind_listener().await?;
        let tcp_port = listener.local_addr()?.port();
        self.device_info.write().await.tcp_port = Some(tcp_port);

        // Accept inbound connections, unless the network policy says no.
        let provider = self.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("TCP accept failed: {}", e);
                        continue;
                    }
                };

                if !provider.policy.allowed() {
                    debug!("Refusing inbound connection from {} (network policy)", addr);
                    continue;
                }

                let provider = provider.clone();
                tokio::spawn(async move {
                    if let Err(e) = provider.run_inbound(stream, addr).await {
                        debug!("Inbound link from {} failed: {}", addr, e);
                    }
                });
            }
        });

        self.tasks.lock().await.push(accept_task);
        Ok(tcp_port)
    }

    /// Start UDP discovery: answer remote announcements with outbound
    /// connects, and announce ourselves periodically
    pub async fn start_discovery(self: &Arc<Self>) -> Result<()> {
        let discovery = UdpDiscovery::bind(
            self.device_info.read().await.clone(),
            self.policy.clone(),
            self.config.broadcast_interval,
        )
        .await?;
        discovery.broadcast_identity().await.ok();
        let (mut discovery_rx, discovery_tasks) = discovery.start();

        let mut tasks = self.tasks.lock().await;
        tasks.extend(discovery_tasks);

        let provider = self.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(DiscoveryEvent::DeviceSeen { info, addr }) = discovery_rx.recv().await {
                provider.connect_to(info, addr).await;
            }
        }));

        Ok(())
    }

    /// Open a link to a known address without waiting for discovery
    pub async fn connect_addr(self: &Arc<Self>, addr: SocketAddr) -> Result<()> {
        self.run_outbound(addr).await
    }
}

/// Read one newline-terminated plaintext line without buffering past it
///
/// Byte-by-byte on purpose: anything read ahead of the newline would be
/// TLS handshake data that must stay in the socket.
async fn read_plaintext_line(stream: &mut TcpStream, max_len: usize) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        let read = timeout(SETUP_TIMEOUT, stream.read_exact(&mut byte))
            .await
            .map_err(|_| ProtocolError::Timeout("reading identity line".to_string()))?;

        match read {
            Ok(_) => {
                line.push(byte[0]);
                if byte[0] == b'\n' {
                    return Ok(line);
                }
                if line.len() > max_len {
                    return Err(ProtocolError::FrameTooLarge {
                        actual: line.len(),
                        max: max_len,
                    });
                }
            }
            Err(e) => return Err(ProtocolError::from_io_error(e, "reading identity line")),
        }
    }
}

/// One TLS-over-TCP link to one peer
pub struct LanLink {
    id: LinkId,
    device_id: String,
    remote_addr: SocketAddr,
    state: StdMutex<LinkState>,
    writer: Mutex<WriteHalf<TlsStream<TcpStream>>>,
    tls: Arc<TlsConfig>,
    /// DER certificate the peer presented; pins payload side-channels
    peer_certificate: Vec<u8>,
    max_frame_len: usize,
    receive_task: StdMutex<Option<JoinHandle<()>>>,
    transfer_tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl LanLink {
    fn new(
        device_id: String,
        remote_addr: SocketAddr,
        stream: TlsStream<TcpStream>,
        tls: Arc<TlsConfig>,
        peer_certificate: Vec<u8>,
        max_frame_len: usize,
    ) -> (Arc<Self>, ReadHalf<TlsStream<TcpStream>>) {
        let (read_half, write_half) = tokio::io::split(stream);

        let link = Arc::new(Self {
            id: LinkId::next(),
            device_id,
            remote_addr,
            state: StdMutex::new(LinkState::Identified),
            writer: Mutex::new(write_half),
            tls,
            peer_certificate,
            max_frame_len,
            receive_task: StdMutex::new(None),
            transfer_tasks: StdMutex::new(Vec::new()),
        });

        (link, read_half)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Frame-reading loop; runs until the link closes or errors
    fn spawn_receive_loop(
        link: Arc<Self>,
        read_half: ReadHalf<TlsStream<TcpStream>>,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) {
        let loop_link = link.clone();
        let handle = tokio::spawn(async move {
            let reason = loop_link.receive_loop(read_half, &events).await;

            loop_link.set_state(LinkState::Closed);
            loop_link.abort_transfers();
            let _ = events.send(LinkEvent::Closed {
                link_id: loop_link.id,
                device_id: Some(loop_link.device_id.clone()),
                reason,
            });
        });

        *link.receive_task.lock().expect("receive task lock poisoned") = Some(handle);
    }

    async fn receive_loop(
        &self,
        read_half: ReadHalf<TlsStream<TcpStream>>,
        events: &mpsc::UnboundedSender<LinkEvent>,
    ) -> String {
        let mut reader = BufReader::new(read_half);
        let mut frame = Vec::new();

        loop {
            frame.clear();

            // Cap enforcement happens while reading: a frame that grows
            // past the limit is an error before it is ever parsed.
            let mut limited = (&mut reader).take(self.max_frame_len as u64 + 1);
            let read = match tokio::io::AsyncBufReadExt::read_until(
                &mut limited,
                b'\n',
                &mut frame,
            )
            .await
            {
                Ok(n) => n,
                Err(e) => return format!("read failed: {}", e),
            };

            if read == 0 {
                return "connection closed by peer".to_string();
            }

            if frame.last() != Some(&b'\n') {
                if frame.len() > self.max_frame_len {
                    warn!(link = %self.id, "Oversized frame, closing link");
                    return format!("frame exceeded {} bytes", self.max_frame_len);
                }
                return "connection closed mid-frame".to_string();
            }

            let packet = match Packet::from_bytes_with_limit(&frame, self.max_frame_len) {
                Ok(p) => p,
                Err(e) => {
                    warn!(link = %self.id, "Undecodable frame, closing link: {}", e);
                    return format!("framing error: {}", e);
                }
            };

            debug!(
                link = %self.id,
                packet_type = %packet.packet_type,
                "Received packet"
            );

            // A declared payload is connected before dispatch so that
            // the payload is ordered directly after its packet.
            let payload = if packet.has_payload() {
                match self.connect_payload(&packet).await {
                    Ok(p) => Some(p),
                    Err(e) => {
                        warn!(link = %self.id, "Payload side-channel failed: {}", e);
                        None
                    }
                }
            } else {
                None
            };

            if events
                .send(LinkEvent::PacketReceived {
                    link_id: self.id,
                    device_id: self.device_id.clone(),
                    packet,
                    payload,
                })
                .is_err()
            {
                return "event channel closed".to_string();
            }
        }
    }

    async fn connect_payload(&self, packet: &Packet) -> Result<Payload> {
        let size = packet
            .payload_size
            .and_then(|s| u64::try_from(s).ok())
            .ok_or_else(|| ProtocolError::PayloadFailed("invalid payloadSize".to_string()))?;
        let port = packet.payload_transfer_port().ok_or_else(|| {
            ProtocolError::PayloadFailed("payloadTransferInfo missing port".to_string())
        })?;

        let client_config = self.tls.client_config(Some(&self.peer_certificate))?;
        Payload::connect(self.remote_addr.ip(), port, client_config, size).await
    }

    fn abort_transfers(&self) {
        let mut transfers = self
            .transfer_tasks
            .lock()
            .expect("transfer task lock poisoned");
        for task in transfers.drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl DeviceLink for LanLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn medium(&self) -> LinkMedium {
        LinkMedium::Lan
    }

    fn priority(&self) -> i32 {
        LAN_LINK_PRIORITY
    }

    fn device_id(&self) -> String {
        self.device_id.clone()
    }

    fn state(&self) -> LinkState {
        *self.state.lock().expect("link state lock poisoned")
    }

    fn set_state(&self, state: LinkState) {
        *self.state.lock().expect("link state lock poisoned") = state;
    }

    async fn send_packet(&self, packet: &Packet) -> Result<()> {
        if !self.state().is_usable() {
            return Err(ProtocolError::Cancelled("link is closed".to_string()));
        }

        let bytes = packet.to_bytes()?;
        if bytes.len() > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                actual: bytes.len(),
                max: self.max_frame_len,
            });
        }

        // The writer mutex serializes senders; frames are never
        // interleaved.
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;

        debug!(
            link = %self.id,
            packet_type = %packet.packet_type,
            bytes = bytes.len(),
            "Sent packet"
        );
        Ok(())
    }

    async fn send_packet_with_payload(
        &self,
        packet: Packet,
        source: PayloadSource,
        wait: bool,
    ) -> Result<()> {
        let upload =
            PayloadUpload::bind(self.tls.server_config(Some(&self.peer_certificate), true)?)
                .await?;

        let mut info = std::collections::HashMap::new();
        info.insert("port".to_string(), serde_json::json!(upload.port()));
        let packet = Packet {
            payload_size: Some(source.size() as i64),
            payload_transfer_info: Some(info),
            ..packet
        };

        self.send_packet(&packet).await?;

        if wait {
            upload.serve(source).await
        } else {
            let link_id = self.id;
            let handle = tokio::spawn(async move {
                if let Err(e) = upload.serve(source).await {
                    warn!(link = %link_id, "Background payload transfer failed: {}", e);
                }
            });

            let mut transfers = self
                .transfer_tasks
                .lock()
                .expect("transfer task lock poisoned");
            transfers.retain(|t| !t.is_finished());
            transfers.push(handle);
            Ok(())
        }
    }

    async fn close(&self, reason: &str) {
        {
            let mut state = self.state.lock().expect("link state lock poisoned");
            if matches!(*state, LinkState::Closed | LinkState::Closing) {
                return;
            }
            *state = LinkState::Closing;
        }

        info!(link = %self.id, device_id = %self.device_id, "Closing link: {}", reason);

        self.abort_transfers();

        if let Some(task) = self
            .receive_task
            .lock()
            .expect("receive task lock poisoned")
            .take()
        {
            task.abort();
        }

        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;

        self.set_state(LinkState::Closed);
    }
}

impl std::fmt::Debug for LanLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanLink")
            .field("id", &self.id)
            .field("device_id", &self.device_id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}
