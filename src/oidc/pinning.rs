//! Certificate fingerprint pinning for issuer endpoints.
//!
//! A pinned issuer's TLS chain must contain a certificate whose SHA-1 or
//! SHA-256 fingerprint is configured. The pin check runs before, and
//! independently of, normal WebPKI chain validation.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, OtherError, RootCertStore,
    SignatureScheme,
};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use x509_parser::prelude::*;

/// Digest used by a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintDigest {
    Sha1,
    Sha256,
}

/// A pinned certificate fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    digest: FingerprintDigest,
    bytes: Vec<u8>,
}

impl Fingerprint {
    /// Parse a hex fingerprint. Separators (`:`) and case are ignored; the
    /// digest is chosen by length (40 hex chars SHA-1, 64 SHA-256).
    pub fn parse(value: &str) -> Result<Self, String> {
        let cleaned: String = value.chars().filter(|c| *c != ':').collect();
        let bytes = hex::decode(&cleaned)
            .map_err(|e| format!("invalid fingerprint '{}': {}", value, e))?;
        let digest = match bytes.len() {
            20 => FingerprintDigest::Sha1,
            32 => FingerprintDigest::Sha256,
            n => {
                return Err(format!(
                    "invalid fingerprint '{}': expected 20 or 32 bytes, got {}",
                    value, n
                ))
            }
        };
        Ok(Self { digest, bytes })
    }

    /// Whether a DER certificate has this fingerprint.
    pub fn matches(&self, der: &[u8]) -> bool {
        match self.digest {
            FingerprintDigest::Sha1 => Sha1::digest(der).as_slice() == self.bytes.as_slice(),
            FingerprintDigest::Sha256 => Sha256::digest(der).as_slice() == self.bytes.as_slice(),
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(&self.bytes))
    }
}

/// Whether any certificate in the chain matches any pin.
pub fn chain_matches(pins: &[Fingerprint], chain: &[&[u8]]) -> bool {
    chain
        .iter()
        .any(|cert| pins.iter().any(|pin| pin.matches(cert)))
}

/// Rejection raised inside the TLS handshake when no pin matches.
#[derive(Debug)]
pub struct FingerprintMismatch;

impl fmt::Display for FingerprintMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no certificate in the presented chain matches a pinned fingerprint")
    }
}

impl StdError for FingerprintMismatch {}

/// WebPKI verifier with an additional fingerprint requirement.
#[derive(Debug)]
struct PinnedVerifier {
    inner: Arc<WebPkiServerVerifier>,
    pins: Vec<Fingerprint>,
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let chain: Vec<&[u8]> = std::iter::once(end_entity.as_ref())
            .chain(intermediates.iter().map(|c| c.as_ref()))
            .collect();

        if !chain_matches(&self.pins, &chain) {
            warn!(
                server = ?server_name,
                subject = %describe_subject(end_entity.as_ref()),
                chain_len = chain.len(),
                "Issuer certificate chain does not match any pinned fingerprint"
            );
            return Err(rustls::Error::InvalidCertificate(CertificateError::Other(
                OtherError(Arc::new(FingerprintMismatch)),
            )));
        }

        self.inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Subject DN of a certificate, for logs.
fn describe_subject(der: &[u8]) -> String {
    match X509Certificate::from_der(der) {
        Ok((_, cert)) => cert.subject().to_string(),
        Err(_) => "<unparseable certificate>".to_string(),
    }
}

/// Build the HTTP client used to talk to one issuer.
pub fn build_client(pins: &[Fingerprint], timeout: Duration) -> Result<reqwest::Client, String> {
    let builder = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("token-bridge/", env!("CARGO_PKG_VERSION")));

    if pins.is_empty() {
        return builder
            .build()
            .map_err(|e| format!("failed to create HTTP client: {}", e));
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let roots = Arc::new(RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    });
    let inner = WebPkiServerVerifier::builder_with_provider(roots, Arc::clone(&provider))
        .build()
        .map_err(|e| format!("failed to build certificate verifier: {}", e))?;

    let tls = tls_config(
        provider,
        PinnedVerifier {
            inner,
            pins: pins.to_vec(),
        },
    )?;

    builder
        .use_preconfigured_tls(tls)
        .build()
        .map_err(|e| format!("failed to create pinned HTTP client: {}", e))
}

fn tls_config(provider: Arc<CryptoProvider>, verifier: PinnedVerifier) -> Result<ClientConfig, String> {
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| format!("failed to configure TLS: {}", e))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(config)
}

/// Whether an HTTP failure was caused by a pin rejection.
///
/// The rustls error arrives wrapped in an `io::Error`, whose `source()`
/// skips the wrapped value, so io errors are unwrapped explicitly.
pub fn is_fingerprint_rejection(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<FingerprintMismatch>() {
            return true;
        }
        if let Some(tls) = e.downcast_ref::<rustls::Error>() {
            if is_pin_error(tls) {
                return true;
            }
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if let Some(inner) = io.get_ref() {
                if is_fingerprint_rejection(inner) {
                    return true;
                }
            }
        }
        current = e.source();
    }
    false
}

fn is_pin_error(err: &rustls::Error) -> bool {
    matches!(
        err,
        rustls::Error::InvalidCertificate(CertificateError::Other(other))
            if other.0.is::<FingerprintMismatch>()
    )
}
