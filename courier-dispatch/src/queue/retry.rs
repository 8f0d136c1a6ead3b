//! Retry policy with exponential backoff

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff schedule for transient send failures
///
/// # Formula
/// `delay = min(base_delay * backoff_base^(retry_count - 1), max_delay) * (1 ± jitter)`
///
/// With the defaults (base 1s, factor 2.0, cap 30s, no jitter) the schedule
/// runs 1s, 2s, 4s, 8s, 16s, 30s, 30s, ...
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries granted to a message after its first failed attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry (milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Ceiling on any single delay (milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier applied per retry
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,

    /// Randomization applied to each delay (0.2 means ±20%)
    #[serde(default)]
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_base: default_backoff_base(),
            jitter_factor: 0.0,
        }
    }
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_base_delay_ms() -> u64 {
    1_000
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

const fn default_backoff_base() -> f64 {
    2.0
}

impl RetryPolicy {
    /// Whether a message with this many consumed retries gets another
    #[must_use]
    pub const fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Backoff delay in milliseconds for the given retry (1-indexed)
    ///
    /// Saturates at `max_delay_ms` whenever the exponential overflows.
    #[must_use]
    pub fn delay_ms(&self, retry_count: u32) -> u64 {
        let exponent = i32::try_from(retry_count.saturating_sub(1)).unwrap_or(i32::MAX);

        // Intentional precision loss and casting for the exponential
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let delay = {
            let raw = (self.base_delay_ms as f64) * self.backoff_base.powi(exponent);
            if raw.is_finite() && raw >= 0.0 {
                (raw as u64).min(self.max_delay_ms)
            } else {
                self.max_delay_ms
            }
        };

        if self.jitter_factor <= 0.0 {
            return delay;
        }

        // Apply jitter: delay * (1 ± jitter_factor)
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        {
            let jitter_range = (delay as f64) * self.jitter_factor;
            let mut rng = rand::rng();
            let jitter: f64 = rng.random_range(-jitter_range..=jitter_range);
            ((delay as f64) + jitter).max(0.0) as u64
        }
    }

    /// Backoff delay as a [`Duration`]
    #[must_use]
    pub fn delay(&self, retry_count: u32) -> Duration {
        Duration::from_millis(self.delay_ms(retry_count))
    }

    /// Timestamp of the next attempt for the given retry (1-indexed)
    #[must_use]
    pub fn next_retry_at(&self, now: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        now + chrono::Duration::milliseconds(
            i64::try_from(self.delay_ms(retry_count)).unwrap_or(i64::MAX),
        )
    }

    /// Retries left for a message with this many already consumed
    #[must_use]
    pub const fn remaining(&self, retry_count: u32) -> u32 {
        self.max_retries.saturating_sub(retry_count)
    }
}
