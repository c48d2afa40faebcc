//! Client-side TLS material for opportunistic STARTTLS.
//!
//! Probes authenticate with a freshly generated self-signed client
//! certificate and accept whatever certificate the server presents: the goal
//! is to observe whether and how a server negotiates TLS, not to trust it.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use rcgen::{CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair};
use thiserror::Error;
use time::OffsetDateTime;
use tokio_rustls::rustls::{
    self, ClientConfig, DigitallySignedStruct, ProtocolVersion, SignatureScheme,
    SupportedProtocolVersion,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
    version,
};

/// Validity of generated client certificates: thirty years.
pub const CLIENT_CERTIFICATE_VALIDITY: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// Protocol versions offered during STARTTLS, newest first. TLS 1.2 is the
/// oldest version rustls implements.
static PROTOCOL_VERSIONS: &[&SupportedProtocolVersion] = &[&version::TLS13, &version::TLS12];

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Failed to generate client certificate: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("Failed to build TLS client configuration: {0}")]
    Config(#[from] rustls::Error),
}

/// Produces client TLS configurations carrying a self-signed certificate.
#[derive(Debug, Clone)]
pub struct CertificateGenerator {
    not_before: SystemTime,
    validity: Duration,
}

impl CertificateGenerator {
    /// A generator whose certificates are valid from `not_before` for `validity`.
    pub const fn new_client(not_before: SystemTime, validity: Duration) -> Self {
        Self {
            not_before,
            validity,
        }
    }

    /// Builds a client configuration presenting a certificate for `common_name`.
    ///
    /// Server certificates are not verified.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation, certificate signing or the rustls
    /// configuration fails.
    pub fn client_tls_config(&self, common_name: &str) -> Result<ClientConfig, CertificateError> {
        let key_pair = KeyPair::generate()?;

        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params.not_before = OffsetDateTime::from(self.not_before);
        params.not_after = params.not_before + self.validity;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        let certificate = params.self_signed(&key_pair)?;
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        let config = ClientConfig::builder_with_protocol_versions(PROTOCOL_VERSIONS)
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_client_auth_cert(vec![certificate.der().clone()], key)?;

        Ok(config)
    }
}

/// Human readable protocol version, e.g. `TLS 1.3`.
pub fn tls_version(version: ProtocolVersion) -> String {
    match version {
        ProtocolVersion::SSLv3 => "SSL 3.0".to_string(),
        ProtocolVersion::TLSv1_0 => "TLS 1.0".to_string(),
        ProtocolVersion::TLSv1_1 => "TLS 1.1".to_string(),
        ProtocolVersion::TLSv1_2 => "TLS 1.2".to_string(),
        ProtocolVersion::TLSv1_3 => "TLS 1.3".to_string(),
        other => format!("unknown (0x{:04x})", u16::from(other)),
    }
}

/// Accepts every server certificate.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}
