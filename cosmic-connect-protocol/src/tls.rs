//! TLS session configuration
//!
//! Builds the rustls client and server configurations used by every
//! encrypted stream in COSMIC Connect: device links and payload
//! side-channels share the single local identity from the key store.
//!
//! ## Trust model
//!
//! Peers authenticate with self-signed certificates under a
//! Trust-On-First-Use model. The trust chain for a known peer is "the
//! one certificate stored for that peer id, exactly": a handshake that
//! presents anything else fails. For a peer with nothing pinned the
//! handshake accepts the presented certificate and leaves the trust
//! decision to the pairing layer.
//!
//! ## Client authentication
//!
//! The server side always *requests* a client certificate. It only
//! *requires* one once the peer is trusted, so that first-contact
//! pairing can proceed while a paired peer can never silently downgrade
//! to an unauthenticated session. The TLS client role belongs to
//! whichever side initiated the TCP connection.

use crate::keystore::{certificate_common_name, certificate_fingerprint, CertificateInfo};
use crate::{ProtocolError, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig,
    SignatureScheme,
};
use std::sync::Arc;

/// TLS configuration factory bound to the local device identity
#[derive(Clone)]
pub struct TlsConfig {
    identity: CertificateInfo,
}

impl TlsConfig {
    pub fn new(identity: CertificateInfo) -> Self {
        Self { identity }
    }

    /// The identity this configuration presents
    pub fn identity(&self) -> &CertificateInfo {
        &self.identity
    }

    /// Client-side config (we initiated the TCP connection)
    ///
    /// `pinned` is the DER certificate stored for the peer, when one
    /// exists; the handshake then accepts exactly that certificate.
    pub fn client_config(&self, pinned: Option<&[u8]>) -> Result<Arc<ClientConfig>> {
        let verifier = PinnedServerVerifier::new(pinned);

        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_client_auth_cert(
                vec![self.identity.rustls_certificate()],
                self.identity.rustls_private_key()?,
            )?;

        Ok(Arc::new(config))
    }

    /// Server-side config (the peer initiated the TCP connection)
    ///
    /// `require_client_auth` must be true for a trusted peer: the
    /// handshake then fails without a client certificate instead of
    /// merely requesting one.
    pub fn server_config(
        &self,
        pinned: Option<&[u8]>,
        require_client_auth: bool,
    ) -> Result<Arc<ServerConfig>> {
        let verifier = PinnedClientVerifier::new(pinned, require_client_auth);

        let config = ServerConfig::builder()
            .with_client_cert_verifier(Arc::new(verifier))
            .with_single_cert(
                vec![self.identity.rustls_certificate()],
                self.identity.rustls_private_key()?,
            )?;

        Ok(Arc::new(config))
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("device_id", &self.identity.device_id)
            .field("fingerprint", &self.identity.fingerprint)
            .finish()
    }
}

/// Validate the certificate presented on an established session against
/// the peer's claimed device id and the stored fingerprint, if any
///
/// Returns the presented certificate's fingerprint on success.
pub fn verify_peer_identity(
    presented_der: &[u8],
    claimed_device_id: &str,
    pinned_fingerprint: Option<&str>,
) -> Result<String> {
    let common_name = certificate_common_name(presented_der)?;
    if common_name != claimed_device_id {
        return Err(ProtocolError::CertificateValidation(format!(
            "certificate CN '{}' does not match device id '{}'",
            common_name, claimed_device_id
        )));
    }

    let fingerprint = certificate_fingerprint(presented_der);
    if let Some(pinned) = pinned_fingerprint {
        if pinned != fingerprint {
            return Err(ProtocolError::PeerIdentityMismatch(
                claimed_device_id.to_string(),
            ));
        }
    }

    Ok(fingerprint)
}

fn supported_algorithms() -> WebPkiSupportedAlgorithms {
    rustls::crypto::ring::default_provider().signature_verification_algorithms
}

fn pin_mismatch() -> rustls::Error {
    rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure)
}

/// Accepts the pinned certificate exactly, or any certificate when
/// nothing is pinned (TOFU)
#[derive(Debug)]
struct PinnedServerVerifier {
    pinned: Option<CertificateDer<'static>>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl PinnedServerVerifier {
    fn new(pinned: Option<&[u8]>) -> Self {
        Self {
            pinned: pinned.map(|der| CertificateDer::from(der.to_vec())),
            algorithms: supported_algorithms(),
        }
    }
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match &self.pinned {
            Some(pinned) if pinned.as_ref() != end_entity.as_ref() => Err(pin_mismatch()),
            _ => Ok(ServerCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Server-side counterpart of `PinnedServerVerifier`
///
/// `mandatory` distinguishes want-client-auth (pairing-phase sessions)
/// from need-client-auth (trusted peers).
#[derive(Debug)]
struct PinnedClientVerifier {
    pinned: Option<CertificateDer<'static>>,
    mandatory: bool,
    root_subjects: Vec<DistinguishedName>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl PinnedClientVerifier {
    fn new(pinned: Option<&[u8]>, mandatory: bool) -> Self {
        Self {
            pinned: pinned.map(|der| CertificateDer::from(der.to_vec())),
            mandatory,
            root_subjects: Vec::new(),
            algorithms: supported_algorithms(),
        }
    }
}

impl ClientCertVerifier for PinnedClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &self.root_subjects
    }

    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        self.mandatory
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        match &self.pinned {
            Some(pinned) if pinned.as_ref() != end_entity.as_ref() => Err(pin_mismatch()),
            _ => Ok(ClientCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
