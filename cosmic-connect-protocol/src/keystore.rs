//! Identity & Key Store
//!
//! Persistent device identity for COSMIC Connect: the local self-signed
//! certificate and private key, the certificates of known peers, and the
//! trust marks that drive pairing decisions.
//!
//! ## Certificate Requirements
//!
//! - **Algorithm**: ECDSA P-256
//! - **Organization (O)**: "COSMIC"
//! - **Organizational Unit (OU)**: "COSMIC Connect"
//! - **Common Name (CN)**: device id
//! - **Validity**: starts one day in the past, lasts ten years
//!
//! ## Storage Layout
//!
//! ```text
//! <store dir>/
//!   certificate.pem     local certificate
//!   private_key.pem     local private key (PKCS#8)
//!   trusted.json        trust marks, device id -> fingerprint
//!   peers/<id>.pem      one certificate per known peer
//! ```
//!
//! All writes go through a temp-file-plus-rename so a partial write can
//! never leave the store readable but broken.
//!
//! A stored local certificate whose common name no longer matches the
//! device id, or which has left its validity window, is discarded and
//! regenerated, and every peer certificate and trust mark is cleared
//! with it, since peers pinned the old identity.

use crate::{ProtocolError, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

/// Certificate validity period
const CERT_VALIDITY_DAYS: i64 = 365 * 10;

/// Organization name in the certificate subject
const CERT_ORG: &str = "COSMIC";

/// Organizational unit in the certificate subject
const CERT_ORG_UNIT: &str = "COSMIC Connect";

/// Local device certificate with its private key
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// Device id (certificate common name)
    pub device_id: String,

    /// DER-encoded certificate
    pub certificate: Vec<u8>,

    /// PEM-encoded PKCS#8 private key
    pub private_key_pem: String,

    /// Lowercase hex SHA-256 fingerprint of the DER certificate
    pub fingerprint: String,
}

impl CertificateInfo {
    /// Generate a new self-signed certificate for this device
    pub fn generate(device_id: impl Into<String>) -> Result<Self> {
        let device_id = device_id.into();

        let mut params = CertificateParams::new(vec![]);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, CERT_ORG);
        dn.push(DnType::OrganizationalUnitName, CERT_ORG_UNIT);
        dn.push(DnType::CommonName, device_id.as_str());
        params.distinguished_name = dn;
        params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;

        // Backdated one day so clock skew between peers cannot reject a
        // freshly generated certificate.
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(CERT_VALIDITY_DAYS);

        let cert = rcgen::Certificate::from_params(params)?;
        let certificate = cert.serialize_der()?;
        let private_key_pem = cert.serialize_private_key_pem();
        let fingerprint = certificate_fingerprint(&certificate);

        info!(
            device_id = %device_id,
            fingerprint = %fingerprint,
            "Generated device certificate"
        );

        Ok(Self {
            device_id,
            certificate,
            private_key_pem,
            fingerprint,
        })
    }

    /// PEM form of the certificate
    pub fn certificate_pem(&self) -> String {
        pem::encode(&pem::Pem::new("CERTIFICATE", self.certificate.clone()))
    }

    /// Certificate in rustls form
    pub fn rustls_certificate(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.certificate.clone())
    }

    /// Private key in rustls form
    pub fn rustls_private_key(&self) -> Result<PrivateKeyDer<'static>> {
        let mut reader = std::io::Cursor::new(self.private_key_pem.as_bytes());
        rustls_pemfile::private_key(&mut reader)
            .map_err(|e| ProtocolError::CertificateValidation(format!("unreadable key: {}", e)))?
            .ok_or_else(|| {
                ProtocolError::CertificateValidation("no private key in PEM".to_string())
            })
    }
}

/// Lowercase hex SHA-256 of a DER-encoded certificate
pub fn certificate_fingerprint(cert_der: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cert_der);
    hex::encode(hasher.finalize())
}

/// Human-readable fingerprint: a colon between every byte
///
/// ```
/// use cosmic_connect_protocol::keystore::format_fingerprint;
///
/// assert_eq!(format_fingerprint("a1b2c3"), "a1:b2:c3");
/// ```
pub fn format_fingerprint(fingerprint: &str) -> String {
    fingerprint
        .as_bytes()
        .chunks(2)
        .map(|c| std::str::from_utf8(c).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(":")
}

/// Extract the common name from a DER-encoded certificate
pub fn certificate_common_name(cert_der: &[u8]) -> Result<String> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| ProtocolError::CertificateValidation(format!("unparseable DER: {}", e)))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
        .ok_or_else(|| {
            ProtocolError::CertificateValidation("certificate has no common name".to_string())
        });
    common_name
}

/// Check that a DER-encoded certificate is currently within its validity
/// window
pub fn certificate_is_valid_now(cert_der: &[u8]) -> Result<bool> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| ProtocolError::CertificateValidation(format!("unparseable DER: {}", e)))?;

    let now = chrono::Utc::now().timestamp();
    let validity = cert.validity();
    Ok(now >= validity.not_before.timestamp() && now <= validity.not_after.timestamp())
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrustRecords {
    /// device id -> pinned fingerprint
    peers: HashMap<String, String>,
}

/// Persistent identity and trust store
///
/// Holds exactly one local identity over the lifetime of the
/// installation, plus per-peer certificates and trust marks. Trust
/// marks, not certificate presence, are authoritative for pairing
/// decisions.
pub struct KeyStore {
    dir: PathBuf,
    local: CertificateInfo,
    /// Known peer certificates (DER), keyed by device id
    peers: HashMap<String, Vec<u8>>,
    trusted: TrustRecords,
}

impl KeyStore {
    /// Open the store at `dir`, loading or creating the local identity
    /// for `device_id`
    pub fn load_or_create(dir: impl Into<PathBuf>, device_id: &str) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(dir.join("peers"))?;

        let (local, regenerated) = Self::bootstrap_local(&dir, device_id)?;

        let mut store = Self {
            dir,
            local,
            peers: HashMap::new(),
            trusted: TrustRecords::default(),
        };

        if regenerated {
            // A new local identity invalidates everything peers pinned.
            store.clear_all_peers()?;
        }

        store.load_peers()?;
        store.load_trust()?;
        Ok(store)
    }

    fn bootstrap_local(dir: &Path, device_id: &str) -> Result<(CertificateInfo, bool)> {
        let cert_path = dir.join("certificate.pem");
        let key_path = dir.join("private_key.pem");

        let mut had_previous = false;
        if cert_path.exists() && key_path.exists() {
            had_previous = true;
            match Self::load_local(&cert_path, &key_path) {
                Ok(existing) => {
                    let valid = certificate_is_valid_now(&existing.certificate).unwrap_or(false);
                    if existing.device_id == device_id && valid {
                        debug!(
                            fingerprint = %existing.fingerprint,
                            "Loaded existing device certificate"
                        );
                        return Ok((existing, false));
                    }
                    warn!(
                        stored_cn = %existing.device_id,
                        device_id = %device_id,
                        valid,
                        "Stored certificate unusable, regenerating and revoking all peer trust"
                    );
                }
                Err(e) => {
                    warn!("Stored certificate unreadable ({}), regenerating", e);
                }
            }
        }

        let cert = CertificateInfo::generate(device_id)?;
        write_atomic(&cert_path, cert.certificate_pem().as_bytes())?;
        write_atomic(&key_path, cert.private_key_pem.as_bytes())?;
        Ok((cert, had_previous))
    }

    fn load_local(cert_path: &Path, key_path: &Path) -> Result<CertificateInfo> {
        let cert_pem = fs::read(cert_path)?;
        let parsed = pem::parse(&cert_pem)
            .map_err(|e| ProtocolError::CertificateValidation(format!("bad PEM: {}", e)))?;
        let certificate = parsed.contents().to_vec();

        let private_key_pem = fs::read_to_string(key_path)?;
        let device_id = certificate_common_name(&certificate)?;
        let fingerprint = certificate_fingerprint(&certificate);

        Ok(CertificateInfo {
            device_id,
            certificate,
            private_key_pem,
            fingerprint,
        })
    }

    fn load_peers(&mut self) -> Result<()> {
        for entry in fs::read_dir(self.dir.join("peers"))? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("pem") {
                continue;
            }

            let Some(device_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            match fs::read(&path).map_err(ProtocolError::Io).and_then(|data| {
                pem::parse(&data)
                    .map(|p| p.contents().to_vec())
                    .map_err(|e| ProtocolError::CertificateValidation(e.to_string()))
            }) {
                Ok(der) => {
                    self.peers.insert(device_id.to_string(), der);
                }
                Err(e) => {
                    warn!(device_id, "Skipping unreadable peer certificate: {}", e);
                }
            }
        }

        debug!("Loaded {} peer certificates", self.peers.len());
        Ok(())
    }

    fn load_trust(&mut self) -> Result<()> {
        let path = self.dir.join("trusted.json");
        if !path.exists() {
            return Ok(());
        }

        let json = fs::read_to_string(&path)?;
        self.trusted = serde_json::from_str(&json).unwrap_or_else(|e| {
            warn!("Trust records unreadable ({}), starting empty", e);
            TrustRecords::default()
        });
        Ok(())
    }

    fn save_trust(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.trusted)?;
        write_atomic(&self.dir.join("trusted.json"), json.as_bytes())
    }

    /// The local identity
    pub fn local(&self) -> &CertificateInfo {
        &self.local
    }

    /// This device's fingerprint
    pub fn fingerprint(&self) -> &str {
        &self.local.fingerprint
    }

    /// Stored certificate for a peer, if any
    pub fn peer_certificate(&self, device_id: &str) -> Option<&[u8]> {
        self.peers.get(device_id).map(|v| v.as_slice())
    }

    /// Fingerprint of the stored certificate for a peer, if any
    pub fn peer_fingerprint(&self, device_id: &str) -> Option<String> {
        self.peers.get(device_id).map(|der| certificate_fingerprint(der))
    }

    /// Store a peer certificate
    ///
    /// The certificate of a trusted peer is pinned: overwriting it with a
    /// different one is refused until trust is removed.
    pub fn put_peer_certificate(&mut self, device_id: &str, cert_der: &[u8]) -> Result<()> {
        if self.is_trusted(device_id) {
            if let Some(existing) = self.peers.get(device_id) {
                if existing != cert_der {
                    return Err(ProtocolError::PeerIdentityMismatch(device_id.to_string()));
                }
                return Ok(());
            }
        }

        let pem = pem::encode(&pem::Pem::new("CERTIFICATE", cert_der.to_vec()));
        write_atomic(&self.peer_path(device_id), pem.as_bytes())?;
        self.peers.insert(device_id.to_string(), cert_der.to_vec());
        debug!(device_id, "Stored peer certificate");
        Ok(())
    }

    /// Remove a peer's certificate and trust mark
    pub fn remove_peer(&mut self, device_id: &str) -> Result<()> {
        let path = self.peer_path(device_id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        self.peers.remove(device_id);
        if self.trusted.peers.remove(device_id).is_some() {
            self.save_trust()?;
        }
        debug!(device_id, "Removed peer");
        Ok(())
    }

    /// Mark a peer trusted, pinning its stored certificate fingerprint
    pub fn mark_trusted(&mut self, device_id: &str) -> Result<()> {
        let fingerprint = self.peer_fingerprint(device_id).ok_or_else(|| {
            ProtocolError::CertificateValidation(format!(
                "no certificate stored for {}",
                device_id
            ))
        })?;

        self.trusted.peers.insert(device_id.to_string(), fingerprint);
        self.save_trust()?;
        info!(device_id, "Peer marked trusted");
        Ok(())
    }

    /// Remove the trust mark for a peer, keeping nothing pinned
    pub fn unmark_trusted(&mut self, device_id: &str) -> Result<()> {
        if self.trusted.peers.remove(device_id).is_some() {
            self.save_trust()?;
            info!(device_id, "Peer trust removed");
        }
        Ok(())
    }

    /// Whether a peer is trusted
    pub fn is_trusted(&self, device_id: &str) -> bool {
        self.trusted.peers.contains_key(device_id)
    }

    /// Device ids of all trusted peers
    pub fn trusted_peers(&self) -> Vec<String> {
        self.trusted.peers.keys().cloned().collect()
    }

    /// Drop every peer certificate and trust mark
    fn clear_all_peers(&mut self) -> Result<()> {
        let peers_dir = self.dir.join("peers");
        if peers_dir.exists() {
            fs::remove_dir_all(&peers_dir)?;
        }
        fs::create_dir_all(&peers_dir)?;

        self.peers.clear();
        self.trusted = TrustRecords::default();
        self.save_trust()?;
        warn!("All peer certificates and trust marks cleared");
        Ok(())
    }

    fn peer_path(&self, device_id: &str) -> PathBuf {
        // Device ids are UUIDs with underscores; anything else is not a
        // valid filename component.
        let safe: String = device_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join("peers").join(format!("{}.pem", safe))
    }
}

/// Write a file atomically: temp file in the same directory, then rename
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_certificate_generation() {
        let cert = CertificateInfo::generate("test_device_123").unwrap();

        assert_eq!(cert.device_id, "test_device_123");
        assert!(!cert.certificate.is_empty());
        assert!(cert.private_key_pem.contains("PRIVATE KEY"));

        // Lowercase hex SHA-256: 64 chars, no separators.
        assert_eq!(cert.fingerprint.len(), 64);
        assert!(cert
            .fingerprint
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        assert_eq!(
            certificate_common_name(&cert.certificate).unwrap(),
            "test_device_123"
        );
        assert!(certificate_is_valid_now(&cert.certificate).unwrap());
    }

    #[test]
    fn test_fingerprint_formatting() {
        let cert = CertificateInfo::generate("dev").unwrap();
        let formatted = format_fingerprint(&cert.fingerprint);

        let parts: Vec<&str> = formatted.split(':').collect();
        assert_eq!(parts.len(), 32);
        for part in parts {
            assert_eq!(part.len(), 2);
        }
    }

    #[test]
    fn test_store_persistence() {
        let dir = TempDir::new().unwrap();

        let fingerprint = {
            let store = KeyStore::load_or_create(dir.path(), "device_a").unwrap();
            store.fingerprint().to_string()
        };

        // Same device id: identity survives a reopen.
        let store = KeyStore::load_or_create(dir.path(), "device_a").unwrap();
        assert_eq!(store.fingerprint(), fingerprint);
    }

    #[test]
    fn test_regeneration_revokes_peer_trust() {
        let dir = TempDir::new().unwrap();
        let peer = CertificateInfo::generate("peer_1").unwrap();

        {
            let mut store = KeyStore::load_or_create(dir.path(), "device_a").unwrap();
            store.put_peer_certificate("peer_1", &peer.certificate).unwrap();
            store.mark_trusted("peer_1").unwrap();
            assert!(store.is_trusted("peer_1"));
        }

        // Reopening under a different device id forces regeneration.
        let store = KeyStore::load_or_create(dir.path(), "device_b").unwrap();
        assert!(!store.is_trusted("peer_1"));
        assert!(store.peer_certificate("peer_1").is_none());
    }

    #[test]
    fn test_trusted_peer_certificate_is_pinned() {
        let dir = TempDir::new().unwrap();
        let mut store = KeyStore::load_or_create(dir.path(), "device_a").unwrap();

        let first = CertificateInfo::generate("peer_1").unwrap();
        let second = CertificateInfo::generate("peer_1").unwrap();

        store.put_peer_certificate("peer_1", &first.certificate).unwrap();
        store.mark_trusted("peer_1").unwrap();

        // Same bytes are fine, a different certificate is refused.
        store.put_peer_certificate("peer_1", &first.certificate).unwrap();
        let err = store
            .put_peer_certificate("peer_1", &second.certificate)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::PeerIdentityMismatch(_)));

        // After trust removal the certificate may be replaced.
        store.unmark_trusted("peer_1").unwrap();
        store.put_peer_certificate("peer_1", &second.certificate).unwrap();
    }

    #[test]
    fn test_rustls_conversion() {
        let cert = CertificateInfo::generate("dev").unwrap();
        assert!(cert.rustls_private_key().is_ok());
        assert!(!cert.rustls_certificate().as_ref().is_empty());
    }
}
