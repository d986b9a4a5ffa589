//! Trusted issuer configuration.

use serde::{Deserialize, Serialize};

use super::pinning::Fingerprint;
use crate::retry::RetryConfig;

/// An external OIDC issuer whose tokens may be exchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrustedIssuerConfig {
    /// Provider name, used to select the issuer per request.
    /// Example: "github"
    pub name: String,

    /// Issuer URL (iss claim). Must match exactly.
    /// Example: "https://token.actions.githubusercontent.com"
    pub issuer_url: String,

    /// Accepted audiences. The token must carry at least one of them.
    pub audiences: Vec<String>,

    /// Pinned certificate fingerprints (SHA-1 or SHA-256, hex).
    /// When set, the issuer's TLS chain must contain a matching certificate.
    #[serde(default)]
    pub fingerprints: Vec<String>,

    /// Audience for issued tokens. Defaults to the exchange-wide audience,
    /// or to the verified token's own audience when neither is set.
    #[serde(default)]
    pub outbound_audience: Vec<String>,
}

impl TrustedIssuerConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("Trusted issuer name is required".to_string());
        }

        if !self.issuer_url.starts_with("https://") && !self.issuer_url.starts_with("http://") {
            return Err(format!(
                "Issuer '{}': issuer_url must be a valid HTTP(S) URL",
                self.name
            ));
        }

        if self.audiences.is_empty() {
            return Err(format!(
                "Issuer '{}': at least one audience is required",
                self.name
            ));
        }

        if !self.fingerprints.is_empty() && !self.issuer_url.starts_with("https://") {
            return Err(format!(
                "Issuer '{}': fingerprints require an https issuer_url",
                self.name
            ));
        }

        for fp in &self.fingerprints {
            Fingerprint::parse(fp).map_err(|e| format!("Issuer '{}': {}", self.name, e))?;
        }

        Ok(())
    }

    /// Parsed fingerprints. Call `validate` first.
    pub fn pins(&self) -> Vec<Fingerprint> {
        self.fingerprints
            .iter()
            .filter_map(|fp| Fingerprint::parse(fp).ok())
            .collect()
    }
}

/// Trust anchor cache and fetch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrustAnchorConfig {
    /// How long a fetched discovery document and key set stay valid.
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,

    /// Minimum age before an unknown key id may force a refresh.
    #[serde(default = "default_min_refresh")]
    pub min_refresh_secs: u64,

    /// Timeout for one HTTP request to the issuer. A whole refresh may take
    /// every retry of both the discovery and the key set request.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_ms: u64,

    /// Retry budget for each HTTP call.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_ttl() -> u64 {
    3600 // 1 hour
}

fn default_min_refresh() -> u64 {
    10
}

fn default_fetch_timeout() -> u64 {
    10_000
}

impl Default for TrustAnchorConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl(),
            min_refresh_secs: default_min_refresh(),
            fetch_timeout_ms: default_fetch_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

impl TrustAnchorConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.ttl_secs == 0 {
            return Err("trust_anchor.ttl_secs must be greater than zero".to_string());
        }
        if self.fetch_timeout_ms == 0 {
            return Err("trust_anchor.fetch_timeout_ms must be greater than zero".to_string());
        }
        self.retry
            .validate()
            .map_err(|e| format!("trust_anchor.retry: {}", e))
    }
}
