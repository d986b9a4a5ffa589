//! Signing capability for outbound tokens.
//!
//! The private key never enters this process's memory in the remote case:
//! a [`Signer`] can only sign bytes and describe its public key. Backends
//! implement the raw capability ([`SigningBackend`]); [`KeySigner`] adds the
//! public-key cache, bounded retries and timeouts on top.

pub mod backend;
pub mod config;
pub mod http;
pub mod managed;

pub use backend::{BackendError, BackendKey, PemKeyBackend, SigningBackend};
pub use config::{BackendConfig, SigningConfig};
pub use http::HttpKeyBackend;
pub use managed::{KeySigner, SignerOptions};

use async_trait::async_trait;
use jsonwebtoken::Algorithm;

use crate::error::Result;

/// Public description of the active signing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningKeyInfo {
    pub key_id: String,
    pub algorithm: Algorithm,
    /// DER-encoded SubjectPublicKeyInfo.
    pub public_key_der: Vec<u8>,
}

/// Capability over a private key held elsewhere.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Sign `message` with the active key. Returns the JWS signature bytes.
    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;

    /// Describe the active key's public component.
    async fn public_key(&self) -> Result<SigningKeyInfo>;
}

/// Parse a JWS algorithm name, accepting only the supported asymmetric set.
pub fn parse_algorithm(name: &str) -> Result<Algorithm, String> {
    match name {
        "RS256" => Ok(Algorithm::RS256),
        "RS384" => Ok(Algorithm::RS384),
        "RS512" => Ok(Algorithm::RS512),
        "PS256" => Ok(Algorithm::PS256),
        "PS384" => Ok(Algorithm::PS384),
        "PS512" => Ok(Algorithm::PS512),
        "ES256" => Ok(Algorithm::ES256),
        "ES384" => Ok(Algorithm::ES384),
        other => Err(format!("unsupported algorithm: {}", other)),
    }
}

/// JWS name of an algorithm.
pub fn algorithm_name(alg: Algorithm) -> &'static str {
    match alg {
        Algorithm::HS256 => "HS256",
        Algorithm::HS384 => "HS384",
        Algorithm::HS512 => "HS512",
        Algorithm::RS256 => "RS256",
        Algorithm::RS384 => "RS384",
        Algorithm::RS512 => "RS512",
        Algorithm::PS256 => "PS256",
        Algorithm::PS384 => "PS384",
        Algorithm::PS512 => "PS512",
        Algorithm::ES256 => "ES256",
        Algorithm::ES384 => "ES384",
        Algorithm::EdDSA => "EdDSA",
    }
}
