//! `Signer` over a backend, with public-key caching, retries and timeouts.

use async_trait::async_trait;
use jsonwebtoken::Algorithm;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::backend::{BackendError, PemKeyBackend, SigningBackend};
use super::config::{BackendConfig, SigningConfig};
use super::http::HttpKeyBackend;
use super::{parse_algorithm, Signer, SigningKeyInfo};
use crate::cache::RefreshCache;
use crate::error::{BridgeError, Result};
use crate::retry::RetryConfig;

/// Public key descriptions keyed by key id.
pub type PublicKeyCache = RefreshCache<String, SigningKeyInfo>;

/// Every option a [`KeySigner`] recognises.
#[derive(Clone)]
pub struct SignerOptions {
    /// Shared cache of public key descriptions.
    pub cache: Arc<PublicKeyCache>,
    /// Retry budget per backend call.
    pub retry: RetryConfig,
    /// Timeout for a single backend call.
    pub timeout: Duration,
}

impl SignerOptions {
    pub fn new(public_key_ttl: Duration, retry: RetryConfig, timeout: Duration) -> Self {
        let cache = RefreshCache::new(
            "public_key",
            public_key_ttl,
            retry.budget(timeout, 1),
            BridgeError::SigningUnavailable,
        );
        Self {
            cache: Arc::new(cache),
            retry,
            timeout,
        }
    }

    pub fn from_config(config: &SigningConfig) -> Self {
        Self::new(
            Duration::from_secs(config.public_key_ttl_secs),
            config.retry.clone(),
            Duration::from_millis(config.timeout_ms),
        )
    }
}

/// Signs with one backend key.
pub struct KeySigner {
    backend: Arc<dyn SigningBackend>,
    key_id: String,
    algorithm: Algorithm,
    options: SignerOptions,
}

impl KeySigner {
    pub fn new(backend: Arc<dyn SigningBackend>, key_id: &str, algorithm: Algorithm, options: SignerOptions) -> Self {
        Self {
            backend,
            key_id: key_id.to_string(),
            algorithm,
            options,
        }
    }

    /// Build the signer described by the configuration. Validate it first.
    pub fn from_config(config: &SigningConfig) -> std::result::Result<Self, String> {
        let algorithm = parse_algorithm(&config.algorithm)?;
        let timeout = Duration::from_millis(config.timeout_ms);

        let backend: Arc<dyn SigningBackend> = match &config.backend {
            BackendConfig::Pem { path } => Arc::new(PemKeyBackend::from_file(&config.key_id, path)?),
            BackendConfig::Http {
                endpoint,
                bearer_token_env,
            } => {
                let token = match bearer_token_env {
                    Some(var) => Some(
                        std::env::var(var).map_err(|_| format!("environment variable {} is not set", var))?,
                    ),
                    None => None,
                };
                Arc::new(HttpKeyBackend::new(endpoint, token, timeout)?)
            }
        };

        debug!(
            key_id = %config.key_id,
            algorithm = ?algorithm,
            backend = backend.name(),
            "Configured signer"
        );

        Ok(Self::new(backend, &config.key_id, algorithm, SignerOptions::from_config(config)))
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

/// One backend call bounded by `timeout`; an elapsed timeout is transient.
async fn bounded<T, F>(timeout: Duration, operation: &str, call: F) -> std::result::Result<T, BackendError>
where
    F: std::future::Future<Output = std::result::Result<T, BackendError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Transient(format!(
            "{} timed out after {:?}",
            operation, timeout
        ))),
    }
}

async fn fetch_public_key(
    backend: Arc<dyn SigningBackend>,
    key_id: String,
    algorithm: Algorithm,
    retry: RetryConfig,
    timeout: Duration,
) -> Result<SigningKeyInfo> {
    debug!(key_id = %key_id, backend = backend.name(), "Fetching public key");

    let backend_ref = &backend;
    let id = key_id.as_str();
    let key = retry
        .run("describe_key", BackendError::is_transient, move || async move {
            bounded(timeout, "describe key", backend_ref.public_key(id)).await
        })
        .await
        .map_err(|e| BridgeError::SigningUnavailable(format!("key '{}': {}", key_id, e)))?;

    if let Some(reported) = key.algorithm {
        if reported != algorithm {
            return Err(BridgeError::SigningUnavailable(format!(
                "key '{}' is a {:?} key, configured for {:?}",
                key_id, reported, algorithm
            )));
        }
    }

    Ok(SigningKeyInfo {
        key_id,
        algorithm,
        public_key_der: key.public_key_der,
    })
}

#[async_trait]
impl Signer for KeySigner {
    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let backend = &self.backend;
        let key_id = self.key_id.as_str();
        let algorithm = self.algorithm;
        let timeout = self.options.timeout;

        self.options
            .retry
            .run("sign", BackendError::is_transient, move || async move {
                bounded(timeout, "sign", backend.sign(key_id, algorithm, message)).await
            })
            .await
            .map_err(|e| {
                warn!(key_id = %key_id, backend = backend.name(), error = %e, "Signing failed");
                BridgeError::SigningUnavailable(format!("key '{}': {}", key_id, e))
            })
    }

    async fn public_key(&self) -> Result<SigningKeyInfo> {
        let backend = Arc::clone(&self.backend);
        let key_id = self.key_id.clone();
        let algorithm = self.algorithm;
        let retry = self.options.retry.clone();
        let timeout = self.options.timeout;

        let entry = self
            .options
            .cache
            .get_or_fetch(&self.key_id, move || {
                fetch_public_key(backend, key_id, algorithm, retry, timeout)
            })
            .await?;
        Ok(entry.value)
    }
}
