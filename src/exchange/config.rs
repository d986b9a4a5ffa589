//! Token exchange configuration.

use serde::{Deserialize, Serialize};

/// Upper bound for the outbound token lifetime.
const MAX_TOKEN_TTL_SECS: u64 = 86_400;

/// Token exchange configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExchangeConfig {
    /// Lifetime of issued tokens in seconds.
    #[serde(default = "default_ttl")]
    pub token_ttl_secs: u64,

    /// Allowance for inbound `iat`/`nbf` slightly in the future.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,

    /// Audience of issued tokens, unless the trusted issuer overrides it.
    /// Empty: reuse the verified token's audience.
    #[serde(default)]
    pub default_audience: Vec<String>,

    /// Log every exchange at info level.
    #[serde(default)]
    pub log_exchanges: bool,
}

fn default_ttl() -> u64 {
    3600 // 1 hour
}

fn default_clock_skew() -> u64 {
    30
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: default_ttl(),
            clock_skew_secs: default_clock_skew(),
            default_audience: vec![],
            log_exchanges: false,
        }
    }
}

impl ExchangeConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.token_ttl_secs == 0 || self.token_ttl_secs > MAX_TOKEN_TTL_SECS {
            return Err(format!(
                "exchange.token_ttl_secs must be between 1 and {}",
                MAX_TOKEN_TTL_SECS
            ));
        }

        if self.clock_skew_secs > 300 {
            return Err("exchange.clock_skew_secs must be at most 300".to_string());
        }

        if self.default_audience.iter().any(String::is_empty) {
            return Err("exchange.default_audience must not contain empty values".to_string());
        }

        Ok(())
    }
}
