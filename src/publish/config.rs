//! Key set publication configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Cache settings for the published key set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeySetConfig {
    /// How long a rendered key set is served before it is rebuilt.
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,

    /// Bound on one rebuild, including the signer round trip. Defaults to
    /// the signer's own public key budget and may not be set below it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_timeout_ms: Option<u64>,
}

fn default_ttl() -> u64 {
    300 // 5 minutes
}

impl Default for KeySetConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl(),
            refresh_timeout_ms: None,
        }
    }
}

impl KeySetConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.ttl_secs == 0 {
            return Err("key_set.ttl_secs must be greater than zero".to_string());
        }
        if self.refresh_timeout_ms == Some(0) {
            return Err("key_set.refresh_timeout_ms must be greater than zero".to_string());
        }
        Ok(())
    }

    /// Rebuild bound for a signer whose public key lookup may take up to
    /// `signer_budget`.
    pub fn refresh_timeout(&self, signer_budget: Duration) -> Duration {
        self.refresh_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(signer_budget)
    }

    /// Reject an explicit bound the signer could exceed.
    pub fn check_signer_budget(&self, signer_budget: Duration) -> Result<(), String> {
        match self.refresh_timeout_ms {
            Some(ms) if Duration::from_millis(ms) < signer_budget => Err(format!(
                "key_set.refresh_timeout_ms ({}) is shorter than the signer's public key budget ({} ms)",
                ms,
                signer_budget.as_millis()
            )),
            _ => Ok(()),
        }
    }
}
