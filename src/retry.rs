//! Bounded retries with exponential backoff.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry budget for a remote call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound for any single delay, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Spread delays by +/-25%.
    #[serde(default = "default_use_jitter")]
    pub use_jitter: bool,
}

/// Hard ceiling on `max_retries`.
const MAX_RETRIES_LIMIT: u32 = 5;

fn default_max_retries() -> u32 {
    2
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2000
}

fn default_use_jitter() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            use_jitter: default_use_jitter(),
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(format!(
                "max_retries must be at most {}, got {}",
                MAX_RETRIES_LIMIT, self.max_retries
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err("initial_backoff_ms must not exceed max_backoff_ms".to_string());
        }
        Ok(())
    }

    fn base_delay_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.base_delay_ms(attempt);
        let delay_ms = if self.use_jitter && base > 0 {
            let factor: f64 = rand::thread_rng().gen_range(0.75..=1.25);
            ((base as f64) * factor) as u64
        } else {
            base
        };

        Duration::from_millis(delay_ms)
    }

    /// Longest time `calls` sequential retried calls can take when each
    /// attempt is bounded by `per_attempt`.
    pub fn budget(&self, per_attempt: Duration, calls: u32) -> Duration {
        let attempts = self.max_retries + 1;
        let backoff_ms: u64 = (1..=self.max_retries)
            .map(|n| {
                let base = self.base_delay_ms(n);
                if self.use_jitter {
                    base + base / 4 + 1
                } else {
                    base
                }
            })
            .sum();
        (per_attempt * attempts + Duration::from_millis(backoff_ms)) * calls
    }

    /// Run `attempt` until it succeeds, fails permanently, or the budget is spent.
    pub async fn run<T, E, F, Fut, R>(&self, operation: &str, retryable: R, mut attempt: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: Display,
    {
        let mut retries = 0;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if retries < self.max_retries && retryable(&e) => {
                    retries += 1;
                    let delay = self.backoff(retries);
                    warn!(
                        operation = %operation,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
