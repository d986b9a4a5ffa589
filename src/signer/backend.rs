//! Raw signing backends.

use async_trait::async_trait;
use jsonwebtoken::Algorithm;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Signer as _};
use rsa::traits::PublicKeyParts;
use rsa::{pkcs1v15, pss, RsaPrivateKey};
use sha2::{Sha256, Sha384, Sha512};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Failure reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Throttling, timeouts, unreachable service. Worth retrying.
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// Disabled key, permission denied, bad request. Retrying will not help.
    #[error("backend rejected request: {0}")]
    Rejected(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

/// Public material of a backend key.
#[derive(Debug, Clone)]
pub struct BackendKey {
    /// DER-encoded SubjectPublicKeyInfo.
    pub public_key_der: Vec<u8>,
    /// Algorithm the backend associates with the key, if it reports one.
    pub algorithm: Option<Algorithm>,
}

/// "Sign this with that key" and "describe that key".
#[async_trait]
pub trait SigningBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn sign(&self, key_id: &str, algorithm: Algorithm, message: &[u8]) -> Result<Vec<u8>, BackendError>;

    async fn public_key(&self, key_id: &str) -> Result<BackendKey, BackendError>;
}

/// RSA key loaded from a local PEM file.
pub struct PemKeyBackend {
    key_id: String,
    private_key: RsaPrivateKey,
    public_key_der: Vec<u8>,
}

impl PemKeyBackend {
    /// Load a PKCS#8 or PKCS#1 RSA private key.
    pub fn from_pem(key_id: &str, pem: &str) -> Result<Self, String> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| format!("invalid RSA private key: {}", e))?;

        let public_key_der = private_key
            .to_public_key()
            .to_public_key_der()
            .map_err(|e| format!("failed to encode public key: {}", e))?
            .as_bytes()
            .to_vec();

        debug!(key_id = %key_id, bits = private_key.size() * 8, "Loaded PEM signing key");

        Ok(Self {
            key_id: key_id.to_string(),
            private_key,
            public_key_der,
        })
    }

    pub fn from_file(key_id: &str, path: &Path) -> Result<Self, String> {
        let pem = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read signing key {}: {}", path.display(), e))?;
        Self::from_pem(key_id, &pem)
    }

    fn check_key(&self, key_id: &str) -> Result<(), BackendError> {
        if key_id != self.key_id {
            return Err(BackendError::Rejected(format!("unknown key '{}'", key_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl SigningBackend for PemKeyBackend {
    fn name(&self) -> &'static str {
        "pem"
    }

    async fn sign(&self, key_id: &str, algorithm: Algorithm, message: &[u8]) -> Result<Vec<u8>, BackendError> {
        self.check_key(key_id)?;

        let key = self.private_key.clone();
        let signature = match algorithm {
            Algorithm::RS256 => pkcs1v15::SigningKey::<Sha256>::new(key).try_sign(message).map(|s| s.to_vec()),
            Algorithm::RS384 => pkcs1v15::SigningKey::<Sha384>::new(key).try_sign(message).map(|s| s.to_vec()),
            Algorithm::RS512 => pkcs1v15::SigningKey::<Sha512>::new(key).try_sign(message).map(|s| s.to_vec()),
            Algorithm::PS256 => pss::BlindedSigningKey::<Sha256>::new(key)
                .try_sign_with_rng(&mut rand::thread_rng(), message)
                .map(|s| s.to_vec()),
            Algorithm::PS384 => pss::BlindedSigningKey::<Sha384>::new(key)
                .try_sign_with_rng(&mut rand::thread_rng(), message)
                .map(|s| s.to_vec()),
            Algorithm::PS512 => pss::BlindedSigningKey::<Sha512>::new(key)
                .try_sign_with_rng(&mut rand::thread_rng(), message)
                .map(|s| s.to_vec()),
            other => {
                return Err(BackendError::Rejected(format!(
                    "algorithm {:?} is not supported by an RSA key",
                    other
                )))
            }
        };

        signature.map_err(|e| BackendError::Rejected(format!("signing failed: {}", e)))
    }

    async fn public_key(&self, key_id: &str) -> Result<BackendKey, BackendError> {
        self.check_key(key_id)?;
        Ok(BackendKey {
            public_key_der: self.public_key_der.clone(),
            algorithm: None,
        })
    }
}
