//! Top-level bridge configuration.

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::exchange::ExchangeConfig;
use crate::oidc::{TrustAnchorConfig, TrustedIssuerConfig};
use crate::publish::KeySetConfig;
use crate::signer::SigningConfig;

/// Configuration file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// This service's own issuer URL (`iss` of issued tokens).
    pub issuer: String,

    #[serde(default)]
    pub exchange: ExchangeConfig,

    /// External issuers whose tokens are accepted.
    pub trust: Vec<TrustedIssuerConfig>,

    #[serde(default)]
    pub trust_anchor: TrustAnchorConfig,

    pub signing: SigningConfig,

    #[serde(default)]
    pub key_set: KeySetConfig,
}

impl BridgeConfig {
    /// Read a JSON configuration file. Does not validate.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Parse a JSON document. Does not validate.
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).context("Failed to parse configuration")
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        if !self.issuer.starts_with("https://") && !self.issuer.starts_with("http://") {
            return Err("issuer must be a valid HTTP(S) URL".to_string());
        }

        if self.trust.is_empty() {
            return Err("at least one trusted issuer is required".to_string());
        }

        let mut names = HashSet::new();
        let mut urls = HashSet::new();
        for issuer in &self.trust {
            issuer.validate()?;
            if !names.insert(issuer.name.as_str()) {
                return Err(format!("duplicate trusted issuer name '{}'", issuer.name));
            }
            if !urls.insert(issuer.issuer_url.as_str()) {
                return Err(format!("duplicate trusted issuer_url '{}'", issuer.issuer_url));
            }
        }

        self.exchange.validate()?;
        self.trust_anchor.validate()?;
        self.signing.validate()?;
        self.key_set.validate()?;
        self.key_set.check_signer_budget(self.signing.public_key_budget())
    }

    /// `validate` for the anyhow edges.
    pub fn check(&self) -> anyhow::Result<()> {
        self.validate().map_err(|e| anyhow!("Invalid configuration: {}", e))
    }
}
