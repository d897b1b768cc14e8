//! Payload Transfer System
//!
//! Binary streams referenced by packets travel out of band: the sender
//! opens a one-shot TCP listener, advertises its port in the packet's
//! `payloadTransferInfo`, and the receiver connects to that port,
//! negotiates TLS with the same identities as the main link, and reads
//! exactly `payloadSize` bytes.
//!
//! Each in-flight upload owns its own bound listener, so two transfers
//! can never share a port. The TCP initiator (the receiver) takes the
//! TLS client role, matching the link setup rule.
//!
//! ## Timeouts and failure
//!
//! Reads that stall longer than the idle timeout, or transfers that
//! exceed a total budget proportional to the declared size, are
//! cancelled. On any failure the side-channel is closed and partially
//! written destination files are removed: a transfer observably yields
//! either all `N` bytes or none.

use crate::{ProtocolError, Result};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

/// Port range for payload listeners
pub const TRANSFER_PORT_START: u16 = 1739;
pub const TRANSFER_PORT_END: u16 = 1764;

/// Timeout for the receiver to connect to an advertised port
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for establishing the side-channel TCP connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle-read timeout: a transfer making no progress for this long is
/// cancelled
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Floor for the total transfer budget
const TOTAL_TIMEOUT_FLOOR: Duration = Duration::from_secs(30);

/// Minimum sustained rate assumed when budgeting the total timeout
const MIN_TRANSFER_RATE: u64 = 64 * 1024;

/// Buffer size for streaming
const BUFFER_SIZE: usize = 65536;

/// Total time budget for a transfer of `size` bytes
fn total_timeout(size: u64) -> Duration {
    TOTAL_TIMEOUT_FLOOR + Duration::from_secs(size / MIN_TRANSFER_RATE)
}

/// Byte source for an outbound payload: a reader plus the declared size
pub struct PayloadSource {
    reader: Pin<Box<dyn AsyncRead + Send>>,
    size: u64,
}

impl PayloadSource {
    pub fn new(reader: impl AsyncRead + Send + 'static, size: u64) -> Self {
        Self {
            reader: Box::pin(reader),
            size,
        }
    }

    /// Source backed by an in-memory buffer
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let size = bytes.len() as u64;
        Self::new(std::io::Cursor::new(bytes), size)
    }

    /// Source backed by a file on disk
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).await?;
        let size = file.metadata().await?.len();
        Ok(Self::new(file, size))
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl std::fmt::Debug for PayloadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadSource").field("size", &self.size).finish()
    }
}

/// One-shot upload listener for a single outbound payload
///
/// Bound at packet-build time so the port can be advertised, consumed
/// by `serve` once the packet has been sent.
pub struct PayloadUpload {
    listener: TcpListener,
    port: u16,
    tls: Arc<ServerConfig>,
}

impl PayloadUpload {
    /// Bind a listener on the first free port in the transfer range
    pub async fn bind(tls: Arc<ServerConfig>) -> Result<Self> {
        for port in TRANSFER_PORT_START..=TRANSFER_PORT_END {
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => {
                    debug!("Payload listener bound on port {}", port);
                    return Ok(Self { listener, port, tls });
                }
                Err(_) => continue,
            }
        }

        Err(ProtocolError::PayloadFailed(format!(
            "no free payload port in range {}-{}",
            TRANSFER_PORT_START, TRANSFER_PORT_END
        )))
    }

    /// Port to advertise in `payloadTransferInfo`
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept exactly one connection, upgrade it to TLS and stream the
    /// source through it
    pub async fn serve(self, mut source: PayloadSource) -> Result<()> {
        let size = source.size();

        let (tcp_stream, peer_addr) = timeout(ACCEPT_TIMEOUT, self.listener.accept())
            .await
            .map_err(|_| {
                ProtocolError::Timeout("no receiver connected to payload port".to_string())
            })?
            .map_err(ProtocolError::Io)?;

        debug!("Payload receiver connected from {}", peer_addr);

        let acceptor = TlsAcceptor::from(self.tls);
        let mut tls_stream = timeout(CONNECT_TIMEOUT, acceptor.accept(tcp_stream))
            .await
            .map_err(|_| ProtocolError::Timeout("payload TLS handshake".to_string()))?
            .map_err(|e| ProtocolError::PayloadFailed(format!("TLS handshake failed: {}", e)))?;

        let budget = total_timeout(size);
        let copy = async {
            copy_exact(&mut source.reader, &mut tls_stream, size).await?;
            tls_stream.flush().await.map_err(ProtocolError::Io)?;
            tls_stream.shutdown().await.map_err(ProtocolError::Io)?;
            Ok::<(), ProtocolError>(())
        };

        timeout(budget, copy)
            .await
            .map_err(|_| ProtocolError::Timeout("payload transfer exceeded budget".to_string()))??;

        info!("Payload sent: {} bytes to {}", size, peer_addr);
        Ok(())
    }
}

impl std::fmt::Debug for PayloadUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadUpload").field("port", &self.port).finish()
    }
}

/// Copy exactly `size` bytes from `reader` to `writer` with an
/// idle-read timeout per chunk
async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, size: u64) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut sent = 0u64;

    while sent < size {
        let want = std::cmp::min((size - sent) as usize, BUFFER_SIZE);
        let read = timeout(IDLE_TIMEOUT, reader.read(&mut buffer[..want]))
            .await
            .map_err(|_| ProtocolError::Timeout("payload read stalled".to_string()))?
            .map_err(ProtocolError::Io)?;

        if read == 0 {
            return Err(ProtocolError::PayloadFailed(format!(
                "source ended early: {} of {} bytes",
                sent, size
            )));
        }

        timeout(IDLE_TIMEOUT, writer.write_all(&buffer[..read]))
            .await
            .map_err(|_| ProtocolError::Timeout("payload write stalled".to_string()))?
            .map_err(ProtocolError::Io)?;

        sent += read as u64;
    }

    Ok(())
}

/// An inbound payload: the side-channel stream attached to exactly one
/// received packet
///
/// Consumed at most once. Dropping an unconsumed payload closes the
/// side-channel.
pub struct Payload {
    stream: tokio_rustls::client::TlsStream<TcpStream>,
    size: u64,
}

impl Payload {
    /// Connect to the advertised transfer endpoint and negotiate TLS
    ///
    /// `peer_ip` is the address the declaring packet arrived from; the
    /// side-channel always targets the same host on the advertised port.
    pub async fn connect(
        peer_ip: IpAddr,
        port: u16,
        tls: Arc<ClientConfig>,
        size: u64,
    ) -> Result<Self> {
        let addr = SocketAddr::new(peer_ip, port);
        debug!("Connecting payload side-channel to {}", addr);

        let tcp_stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtocolError::Timeout("payload connect".to_string()))?
            .map_err(|e| ProtocolError::from_io_error(e, "payload connect"))?;

        // TOFU: identity pinning already happened on the main link, the
        // SNI name is a fixed placeholder.
        let server_name = ServerName::try_from("cosmic-connect")
            .map_err(|e| ProtocolError::PayloadFailed(format!("invalid SNI name: {}", e)))?;

        let connector = TlsConnector::from(tls);
        let stream = timeout(CONNECT_TIMEOUT, connector.connect(server_name, tcp_stream))
            .await
            .map_err(|_| ProtocolError::Timeout("payload TLS handshake".to_string()))?
            .map_err(|e| ProtocolError::PayloadFailed(format!("TLS handshake failed: {}", e)))?;

        Ok(Self { stream, size })
    }

    /// Declared size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Drain the payload into memory
    ///
    /// Intended for small payloads (clipboard content, thumbnails);
    /// file-sized payloads should use `receive_to_file`.
    pub async fn read_all(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.size as usize);
        let budget = total_timeout(self.size);

        let read = async {
            let mut buffer = vec![0u8; BUFFER_SIZE];
            while (out.len() as u64) < self.size {
                let want =
                    std::cmp::min((self.size - out.len() as u64) as usize, BUFFER_SIZE);
                let n = timeout(IDLE_TIMEOUT, self.stream.read(&mut buffer[..want]))
                    .await
                    .map_err(|_| ProtocolError::Timeout("payload read stalled".to_string()))?
                    .map_err(ProtocolError::Io)?;
                if n == 0 {
                    return Err(ProtocolError::PayloadFailed(format!(
                        "side-channel closed early: {} of {} bytes",
                        out.len(),
                        self.size
                    )));
                }
                out.extend_from_slice(&buffer[..n]);
            }
            Ok::<(), ProtocolError>(())
        };

        timeout(budget, read)
            .await
            .map_err(|_| ProtocolError::Timeout("payload transfer exceeded budget".to_string()))??;

        debug!("Payload drained: {} bytes", out.len());
        Ok(out)
    }

    /// Stream the payload to a file, removing the partial file on any
    /// failure
    pub async fn receive_to_file(mut self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref().to_path_buf();
        let mut file = create_file_safe(&path).await?;

        let budget = total_timeout(self.size);
        let transfer = async {
            copy_exact(&mut self.stream, &mut file, self.size).await?;
            file.flush().await.map_err(ProtocolError::Io)?;
            Ok::<(), ProtocolError>(())
        };

        let result = timeout(budget, transfer)
            .await
            .map_err(|_| ProtocolError::Timeout("payload transfer exceeded budget".to_string()))
            .and_then(|r| r);

        match result {
            Ok(()) => {
                info!("Payload received: {} bytes to {:?}", self.size, path);
                Ok(path)
            }
            Err(e) => {
                warn!("Payload transfer failed ({}), removing {:?}", e, path);
                cleanup_partial_file(&path).await;
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload").field("size", &self.size).finish()
    }
}

/// Create the destination file, creating parent directories as needed
async fn create_file_safe(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    File::create(path)
        .await
        .map_err(|e| ProtocolError::from_io_error(e, "creating payload destination"))
}

/// Best-effort removal of a partially written destination
async fn cleanup_partial_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove partial file {:?}: {}", path, e);
        }
    }
}

/// Pick a collision-free destination under `dir` for `filename`
///
/// `report.pdf` becomes `report (1).pdf`, `report (2).pdf`, … when the
/// plain name is taken.
pub fn unique_destination(dir: &Path, filename: &str) -> PathBuf {
    // Strip any path components a remote peer may have smuggled in.
    let name = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("download");

    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let stem = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("download");
    let ext = Path::new(name).extension().and_then(|s| s.to_str());

    for i in 1u32.. {
        let numbered = match ext {
            Some(ext) => format!("{} ({}).{}", stem, i, ext),
            None => format!("{} ({})", stem, i),
        };
        let candidate = dir.join(numbered);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}
