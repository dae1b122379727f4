//! rustls client configuration assembled from PEM secrets.

use rumqttc::tokio_rustls::rustls;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::io::BufReader;
use std::sync::Arc;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TlsError {
    #[error("failed to parse {0} PEM: {1}")]
    Pem(&'static str, String),
    #[error("{0} PEM block is empty")]
    Empty(&'static str),
    #[error("invalid TLS configuration: {0}")]
    Config(String),
}

/// TLS renegotiation policy requested for a destination.
///
/// rustls never renegotiates, so the policy is carried for configuration
/// compatibility only; every value results in the same handshake behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenegotiationSupport {
    #[default]
    Never,
    OnceAsClient,
    FreelyAsClient,
}

impl RenegotiationSupport {
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "" | "0" => Some(Self::Never),
            "1" => Some(Self::OnceAsClient),
            "2" => Some(Self::FreelyAsClient),
            _ => None,
        }
    }
}

/// Certificate material for a TLS client.
#[derive(Debug, Clone, Default)]
pub struct TlsMaterial {
    pub ca_pem: Option<String>,
    pub client_cert_pem: Option<String>,
    pub client_key_pem: Option<String>,
    pub skip_verify: bool,
    pub renegotiation: RenegotiationSupport,
}

pub fn parse_certificates(
    label: &'static str,
    pem: &str,
) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = BufReader::new(pem.as_bytes());
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| TlsError::Pem(label, err.to_string()))?;
    if certs.is_empty() {
        return Err(TlsError::Empty(label));
    }
    Ok(certs)
}

pub fn parse_private_key(label: &'static str, pem: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = BufReader::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|err| TlsError::Pem(label, err.to_string()))?
        .ok_or(TlsError::Empty(label))
}

/// Builds a client config trusting the bundled web roots plus any CA in `material`.
pub fn build_client_config(material: &TlsMaterial) -> Result<Arc<ClientConfig>, TlsError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(ca) = material.ca_pem.as_deref() {
        for cert in parse_certificates("ca", ca)? {
            roots
                .add(cert)
                .map_err(|err| TlsError::Pem("ca", err.to_string()))?;
        }
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let mut config = match (
        material.client_cert_pem.as_deref(),
        material.client_key_pem.as_deref(),
    ) {
        (Some(cert), Some(key)) => {
            let chain = parse_certificates("cert", cert)?;
            let key = parse_private_key("key", key)?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|err| TlsError::Config(err.to_string()))?
        }
        _ => builder.with_no_client_auth(),
    };

    if material.skip_verify {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerification));
    }
    if material.renegotiation != RenegotiationSupport::Never {
        tracing::debug!(
            policy = ?material.renegotiation,
            "TLS renegotiation requested; rustls does not renegotiate"
        );
    }
    Ok(Arc::new(config))
}

#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
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
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
