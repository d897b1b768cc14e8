//! Share Plugin
//!
//! Receives files, text and URLs shared from the peer, and shares ours.
//!
//! ## Packet Format
//!
//! A share is one `kdeconnect.share.request` packet carrying exactly
//! one of:
//!
//! ```json
//! { "filename": "image.png", "numberOfFiles": 1, "totalPayloadSize": 12345 }
//! ```
//! (with `payloadSize`/`payloadTransferInfo` set; the file bytes travel
//! on the payload side-channel), or
//!
//! ```json
//! { "text": "Some text to share" }
//! ```
//! or
//!
//! ```json
//! { "url": "https://example.com" }
//! ```
//!
//! URLs are passed through the SSRF validator in both directions; a
//! rejected URL is never opened and never sent.

use super::{DeviceHandle, Plugin, PluginDescriptor};
use crate::payload::{unique_destination, Payload, PayloadSource};
use crate::urlcheck;
use crate::{Packet, ProtocolError, Result};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Process-wide download directory for instances created through the
/// plugin registry
static DEFAULT_DOWNLOAD_DIR: OnceCell<PathBuf> = OnceCell::new();

/// Set where received files land, for every share instance created
/// afterwards. The first call wins; returns false when a directory was
/// already set.
pub fn set_default_download_dir(dir: impl Into<PathBuf>) -> bool {
    DEFAULT_DOWNLOAD_DIR.set(dir.into()).is_ok()
}

pub static DESCRIPTOR: PluginDescriptor = PluginDescriptor {
    key: "share",
    display_name: "Share and receive",
    description: "Share files, text and URLs with the paired device",
    incoming: &["kdeconnect.share.request"],
    outgoing: &["kdeconnect.share.request"],
    enabled_by_default: true,
    listen_to_unpaired: false,
    permissions: &["storage"],
};

/// What a received share resolved to
#[derive(Debug, Clone, PartialEq)]
pub enum ShareContent {
    /// A file transfer was started towards this destination
    File { filename: String, destination: PathBuf },
    Text(String),
    Url(String),
    /// A URL that failed validation, kept for diagnostics
    RejectedUrl { url: String, reason: String },
}

/// Share plugin instance
#[derive(Debug)]
pub struct SharePlugin {
    /// Directory received files land in
    download_dir: PathBuf,

    /// Received shares, oldest first
    received: Vec<ShareContent>,
}

impl Default for SharePlugin {
    fn default() -> Self {
        let download_dir = DEFAULT_DOWNLOAD_DIR
            .get()
            .cloned()
            .unwrap_or_else(|| std::env::temp_dir().join("cosmic-connect-downloads"));
        Self {
            download_dir,
            received: Vec::new(),
        }
    }
}

impl SharePlugin {
    pub fn with_download_dir(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            received: Vec::new(),
        }
    }

    pub fn received(&self) -> &[ShareContent] {
        &self.received
    }

    /// Share a file with the device
    ///
    /// The packet goes out with an attached payload source; the actual
    /// byte pump runs on the connection manager.
    pub async fn share_file(device: &DeviceHandle, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ProtocolError::Plugin("unusable filename".to_string()))?
            .to_string();

        let source = PayloadSource::from_file(path).await?;
        let packet = Packet::new(
            "kdeconnect.share.request",
            json!({
                "filename": filename,
                "numberOfFiles": 1,
                "totalPayloadSize": source.size(),
            }),
        );

        device.send_packet_with_payload(packet, source, false)
    }

    /// Share a piece of text with the device
    pub fn share_text(device: &DeviceHandle, text: &str) -> Result<()> {
        device.send_packet(Packet::new(
            "kdeconnect.share.request",
            json!({ "text": text }),
        ))
    }

    /// Share a URL with the device; rejected URLs never leave the host
    pub fn share_url(device: &DeviceHandle, url: &str) -> Result<()> {
        let sanitized = urlcheck::sanitize(url).ok_or_else(|| {
            let rejection = urlcheck::validate(url).unwrap_err();
            ProtocolError::Plugin(format!("refusing to share URL: {}", rejection))
        })?;

        device.send_packet(Packet::new(
            "kdeconnect.share.request",
            json!({ "url": sanitized }),
        ))
    }

    async fn handle_file(
        &mut self,
        packet: &Packet,
        payload: Option<Payload>,
        filename: String,
        device: &DeviceHandle,
    ) -> Result<()> {
        let Some(payload) = payload else {
            warn!(
                filename = %filename,
                "Share packet declared a file but no payload channel attached"
            );
            return Err(ProtocolError::PayloadFailed(
                "file share without payload".to_string(),
            ));
        };

        let declared = packet.payload_size.unwrap_or(0);
        let destination = unique_destination(&self.download_dir, &filename);

        info!(
            device_name = %device.device_name(),
            filename = %filename,
            bytes = declared,
            destination = %destination.display(),
            "Receiving shared file"
        );

        self.received.push(ShareContent::File {
            filename,
            destination: destination.clone(),
        });

        // Drain on a worker so dispatch of subsequent packets is not
        // held up by a slow transfer.
        tokio::spawn(async move {
            match payload.receive_to_file(&destination).await {
                Ok(path) => info!(path = %path.display(), "Shared file received"),
                Err(e) => warn!("Shared file transfer failed: {}", e),
            }
        });

        Ok(())
    }
}

#[async_trait]
impl Plugin for SharePlugin {
    fn descriptor(&self) -> &'static PluginDescriptor {
        &DESCRIPTOR
    }

    async fn create(&mut self, device: &DeviceHandle) -> Result<()> {
        debug!(
            device_id = %device.device_id(),
            download_dir = %self.download_dir.display(),
            "Share plugin ready"
        );
        Ok(())
    }

    async fn handle_packet(
        &mut self,
        packet: &Packet,
        payload: Option<Payload>,
        device: &DeviceHandle,
    ) -> Result<bool> {
        if !packet.is_type("kdeconnect.share.request") {
            return Ok(false);
        }

        if let Some(filename) = packet.get_body_field::<String>("filename") {
            self.handle_file(packet, payload, filename, device).await?;
            return Ok(true);
        }

        if let Some(text) = packet.get_body_field::<String>("text") {
            info!(
                device_name = %device.device_name(),
                bytes = text.len(),
                "Text share received"
            );
            self.received.push(ShareContent::Text(text));
            return Ok(true);
        }

        if let Some(url) = packet.get_body_field::<String>("url") {
            match urlcheck::validate(&url) {
                Ok(_) => {
                    info!(device_name = %device.device_name(), url = %url, "URL share received");
                    self.received.push(ShareContent::Url(url));
                }
                Err(rejection) => {
                    warn!(
                        device_name = %device.device_name(),
                        url = %url,
                        "Rejected shared URL: {}",
                        rejection
                    );
                    self.received.push(ShareContent::RejectedUrl {
                        url,
                        reason: rejection.to_string(),
                    });
                }
            }
            return Ok(true);
        }

        debug!("Share packet with no recognizable content, ignoring");
        Ok(true)
    }

    async fn destroy(&mut self) {
        debug!("Share plugin destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn handle() -> (
        DeviceHandle,
        mpsc::UnboundedReceiver<(String, crate::plugins::OutboundPacket)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            DeviceHandle::new(
                "peer".into(),
                "Peer".into(),
                Arc::new(AtomicBool::new(true)),
                tx,
            ),
            rx,
        )
    }

    #[tokio::test]
    async fn test_text_share() {
        let (device, _rx) = handle();
        let mut plugin = SharePlugin::default();

        let packet = Packet::new("kdeconnect.share.request", json!({"text": "note to self"}));
        plugin.handle_packet(&packet, None, &device).await.unwrap();

        assert_eq!(
            plugin.received(),
            &[ShareContent::Text("note to self".to_string())]
        );
    }

    #[tokio::test]
    async fn test_url_share_validated() {
        let (device, _rx) = handle();
        let mut plugin = SharePlugin::default();

        let good = Packet::new(
            "kdeconnect.share.request",
            json!({"url": "https://example.com/page"}),
        );
        plugin.handle_packet(&good, None, &device).await.unwrap();

        let bad = Packet::new(
            "kdeconnect.share.request",
            json!({"url": "http://169.254.169.254/latest/meta-data/"}),
        );
        plugin.handle_packet(&bad, None, &device).await.unwrap();

        assert_eq!(plugin.received().len(), 2);
        assert!(matches!(plugin.received()[0], ShareContent::Url(_)));
        match &plugin.received()[1] {
            ShareContent::RejectedUrl { reason, .. } => {
                assert!(reason.contains("SSRF"));
                assert!(reason.contains("metadata"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_file_share_without_payload_errors() {
        let (device, _rx) = handle();
        let mut plugin = SharePlugin::default();

        let packet = Packet::new(
            "kdeconnect.share.request",
            json!({"filename": "a.txt", "numberOfFiles": 1, "totalPayloadSize": 11}),
        );
        let result = plugin.handle_packet(&packet, None, &device).await;
        assert!(matches!(result, Err(ProtocolError::PayloadFailed(_))));
    }

    #[test]
    fn test_share_url_refuses_invalid() {
        let (device, _rx) = handle();
        let err = SharePlugin::share_url(&device, "http://127.0.0.1:6379/").unwrap_err();
        assert!(matches!(err, ProtocolError::Plugin(_)));
    }

    #[test]
    fn test_share_url_sends_sanitized() {
        let (device, mut rx) = handle();
        SharePlugin::share_url(&device, "https://example.com/x?a=1").unwrap();

        let (_, outbound) = rx.try_recv().unwrap();
        match outbound {
            crate::plugins::OutboundPacket::Plain(p) => {
                assert_eq!(
                    p.get_body_field::<String>("url"),
                    Some("https://example.com/x?a=1".to_string())
                );
            }
            other => panic!("unexpected outbound: {:?}", other),
        }
    }
}
