//! Signing configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::parse_algorithm;
use crate::retry::RetryConfig;

/// Outbound token signing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SigningConfig {
    /// Identifier of the signing key at the backend; published as `kid`.
    pub key_id: String,

    /// Signing algorithm (RS256, RS384, RS512, PS256, PS384, PS512, ES256, ES384).
    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    /// Where the private key lives.
    pub backend: BackendConfig,

    /// How long the public key description is cached.
    #[serde(default = "default_public_key_ttl")]
    pub public_key_ttl_secs: u64,

    /// Timeout for a single backend call.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    /// Retry budget for backend calls.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Signing backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum BackendConfig {
    /// RSA private key in a local PEM file (PKCS#1 or PKCS#8).
    Pem { path: PathBuf },

    /// Remote signing service.
    Http {
        /// Base URL, e.g. "https://signer.internal/v1".
        endpoint: String,
        /// Environment variable holding a bearer token for the service.
        #[serde(default)]
        bearer_token_env: Option<String>,
    },
}

fn default_algorithm() -> String {
    "RS256".to_string()
}

fn default_public_key_ttl() -> u64 {
    3600 // 1 hour
}

fn default_timeout() -> u64 {
    5000
}

impl SigningConfig {
    /// Longest a public key lookup may take, retries included.
    pub fn public_key_budget(&self) -> Duration {
        self.retry.budget(Duration::from_millis(self.timeout_ms), 1)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.key_id.is_empty() {
            return Err("signing.key_id is required".to_string());
        }

        let algorithm = parse_algorithm(&self.algorithm).map_err(|e| format!("signing.algorithm: {}", e))?;

        match &self.backend {
            BackendConfig::Pem { path } => {
                if path.as_os_str().is_empty() {
                    return Err("signing.backend.path is required".to_string());
                }
                if !self.algorithm.starts_with("RS") && !self.algorithm.starts_with("PS") {
                    return Err(format!(
                        "signing.algorithm {:?} is not supported by the pem backend (RSA only)",
                        algorithm
                    ));
                }
            }
            BackendConfig::Http { endpoint, .. } => {
                if !endpoint.starts_with("https://") && !endpoint.starts_with("http://") {
                    return Err("signing.backend.endpoint must be a valid HTTP(S) URL".to_string());
                }
            }
        }

        if self.public_key_ttl_secs == 0 {
            return Err("signing.public_key_ttl_secs must be greater than zero".to_string());
        }
        if self.timeout_ms == 0 {
            return Err("signing.timeout_ms must be greater than zero".to_string());
        }

        self.retry
            .validate()
            .map_err(|e| format!("signing.retry: {}", e))
    }
}
