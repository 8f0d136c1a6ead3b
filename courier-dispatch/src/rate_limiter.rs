//! Two-level rate limiting using the token bucket algorithm
//!
//! Protects the upstream messaging provider from aggregate overload (one
//! global bucket sized for the provider account) while keeping any single
//! tenant from starving the rest (one bucket per tenant). Each admission
//! consumes one token from both buckets or neither.
//!
//! # Token Bucket Algorithm
//!
//! - Tokens are added to the bucket at a constant rate (`refill_rate`)
//! - Each admitted message consumes one token
//! - An empty bucket reports how long until the next token
//! - Bucket has maximum capacity (allows bursts)
//!
//! # Example
//!
//! ```text
//! Global: 80 msg/sec, burst 100; tenant: 10 msg/sec, burst 20
//! - A tenant can send 20 messages immediately (its burst)
//! - Then it is held to 10/sec sustained, even if the account has room
//! - All tenants together never exceed 100 at once or 80/sec sustained
//! ```

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use courier_common::TenantId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// How long the per-bucket send counter accumulates before resetting
const WINDOW: Duration = Duration::from_secs(60);

/// Configuration for rate limiting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Messages per second across all tenants (provider account limit)
    #[serde(default = "default_messages_per_second")]
    pub messages_per_second: f64,

    /// Global burst size (max tokens in the shared bucket)
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,

    /// Default messages per second for a single tenant
    #[serde(default = "default_tenant_messages_per_second")]
    pub tenant_messages_per_second: f64,

    /// Default burst size for a single tenant
    #[serde(default = "default_tenant_burst_size")]
    pub tenant_burst_size: u32,

    /// Per-tenant rate limit overrides, keyed by tenant ID
    #[serde(default)]
    pub tenant_limits: ahash::AHashMap<String, TenantRateLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            messages_per_second: default_messages_per_second(),
            burst_size: default_burst_size(),
            tenant_messages_per_second: default_tenant_messages_per_second(),
            tenant_burst_size: default_tenant_burst_size(),
            tenant_limits: ahash::AHashMap::default(),
        }
    }
}

const fn default_messages_per_second() -> f64 {
    80.0 // Provider account ceiling
}

const fn default_burst_size() -> u32 {
    100
}

const fn default_tenant_messages_per_second() -> f64 {
    10.0
}

const fn default_tenant_burst_size() -> u32 {
    20
}

/// Per-tenant rate limit override
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantRateLimit {
    /// Messages per second for this tenant
    pub messages_per_second: f64,
    /// Burst size for this tenant
    pub burst_size: u32,
}

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitDecision {
    /// One token consumed from both levels; the send may proceed
    Granted,
    /// The tenant's own bucket is empty; only this tenant must wait
    TenantLimited {
        /// Time until the tenant's next token
        wait: Duration,
    },
    /// The shared account bucket is empty; every tenant must wait
    GloballyLimited {
        /// Time until a send could succeed again
        wait: Duration,
    },
}

impl AdmitDecision {
    /// Whether the admission succeeded
    #[must_use]
    pub const fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }

    /// Suggested wait before retrying, when limited
    #[must_use]
    pub const fn wait(&self) -> Option<Duration> {
        match self {
            Self::Granted => None,
            Self::TenantLimited { wait } | Self::GloballyLimited { wait } => Some(*wait),
        }
    }
}

/// Token bucket for one admission level
#[derive(Debug)]
struct TokenBucket {
    /// Current number of tokens
    tokens: f64,
    /// Maximum tokens (burst size)
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
    /// Last time tokens were added
    last_refill: Instant,
    /// Admissions granted in the current counting window
    sent_this_window: u64,
    /// When the current counting window started
    window_start: Instant,
    /// Last time this bucket admitted or was asked to
    last_used: Instant,
}

impl TokenBucket {
    fn new(messages_per_second: f64, burst_size: u32) -> Self {
        let now = Instant::now();
        let capacity = f64::from(burst_size);
        Self {
            tokens: capacity, // Start with full bucket
            capacity,
            refill_rate: messages_per_second,
            last_refill: now,
            sent_this_window: 0,
            window_start: now,
            last_used: now,
        }
    }

    /// Refill tokens based on elapsed time and roll the counting window
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();

        let tokens_to_add = elapsed * self.refill_rate;
        self.tokens = (self.tokens + tokens_to_add).min(self.capacity);
        self.last_refill = now;

        if now.duration_since(self.window_start) >= WINDOW {
            self.sent_this_window = 0;
            self.window_start = now;
        }
    }

    /// Whether a token is available right now (call after `refill`)
    fn has_token(&self) -> bool {
        self.tokens >= 1.0
    }

    /// Take one token (call only after `has_token` returned true)
    fn consume(&mut self, now: Instant) {
        self.tokens -= 1.0;
        self.sent_this_window += 1;
        self.last_used = now;
    }

    /// Refill, then consume a token if one is available
    fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);

        if self.has_token() {
            self.consume(now);
            true
        } else {
            false
        }
    }

    /// Wait until the next token, rounded up to whole milliseconds
    fn time_until_available(&self) -> Duration {
        if self.has_token() {
            return Duration::ZERO;
        }

        let tokens_needed = 1.0 - self.tokens;
        let millis = (tokens_needed / self.refill_rate * 1000.0).ceil();
        Duration::from_millis(millis as u64)
    }
}

/// Two-level rate limiter: one shared bucket plus one bucket per tenant
#[derive(Debug)]
pub struct RateLimiter {
    /// Configuration
    config: RateLimitConfig,
    /// Shared bucket covering the entire provider account
    global: parking_lot::Mutex<TokenBucket>,
    /// Per-tenant token buckets, created on first use
    buckets: DashMap<TenantId, Arc<parking_lot::Mutex<TokenBucket>>>,
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        let global = parking_lot::Mutex::new(TokenBucket::new(
            config.messages_per_second,
            config.burst_size,
        ));

        Self {
            config,
            global,
            buckets: DashMap::new(),
        }
    }

    /// Get or create a token bucket for a tenant
    fn get_bucket(&self, tenant: &TenantId) -> Arc<parking_lot::Mutex<TokenBucket>> {
        self.buckets
            .entry(tenant.clone())
            .or_insert_with(|| {
                let (messages_per_second, burst_size) =
                    self.config.tenant_limits.get(tenant.as_str()).map_or_else(
                        || {
                            (
                                self.config.tenant_messages_per_second,
                                self.config.tenant_burst_size,
                            )
                        },
                        |limit| (limit.messages_per_second, limit.burst_size),
                    );

                Arc::new(parking_lot::Mutex::new(TokenBucket::new(
                    messages_per_second,
                    burst_size,
                )))
            })
            .clone()
    }

    /// Check whether a message from this tenant may be sent now
    ///
    /// Consumes one token from the global bucket and one from the tenant's
    /// bucket, or from neither. A denial never costs tokens, so a limited
    /// tenant cannot drain capacity it is not using.
    pub fn check_and_consume(&self, tenant: &TenantId) -> AdmitDecision {
        let tenant_bucket = self.get_bucket(tenant);

        // Lock order is always global then tenant.
        let mut global = self.global.lock();
        let mut bucket = tenant_bucket.lock();

        let now = Instant::now();
        global.refill(now);
        bucket.refill(now);
        bucket.last_used = now;

        if global.has_token() && bucket.has_token() {
            global.consume(now);
            bucket.consume(now);
            return AdmitDecision::Granted;
        }

        if global.has_token() {
            let wait = bucket.time_until_available();
            drop(bucket);
            drop(global);
            tracing::debug!(
                tenant = %tenant,
                wait_seconds = wait.as_secs_f64(),
                "Tenant rate limit exceeded, must wait"
            );
            return AdmitDecision::TenantLimited { wait };
        }

        // Report the longer wait when both levels are dry.
        let wait = global.time_until_available().max(bucket.time_until_available());
        drop(bucket);
        drop(global);
        tracing::debug!(
            tenant = %tenant,
            wait_seconds = wait.as_secs_f64(),
            "Account rate limit exceeded, all tenants must wait"
        );
        AdmitDecision::GloballyLimited { wait }
    }

    /// Drop per-tenant buckets that have not been used for `max_idle`
    ///
    /// Returns how many buckets were removed. A dropped bucket reappears
    /// full on the tenant's next send, which is the same admission state an
    /// idle tenant would have refilled to anyway.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();

        // No caller touches the map while holding a bucket lock, so locking
        // inside retain cannot deadlock.
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.lock().last_used) < max_idle);

        before.saturating_sub(self.buckets.len())
    }

    /// Snapshot of the shared account bucket (for monitoring)
    pub fn global_stats(&self) -> RateLimitStats {
        let mut global = self.global.lock();
        global.refill(Instant::now());

        RateLimitStats {
            available_tokens: global.tokens,
            capacity: global.capacity,
            refill_rate: global.refill_rate,
            sent_this_window: global.sent_this_window,
        }
    }

    /// Snapshot of one tenant's bucket, if the tenant has sent recently
    pub fn tenant_stats(&self, tenant: &TenantId) -> Option<RateLimitStats> {
        self.buckets.get(tenant).map(|bucket| {
            let mut bucket = bucket.lock();
            bucket.refill(Instant::now());

            RateLimitStats {
                available_tokens: bucket.tokens,
                capacity: bucket.capacity,
                refill_rate: bucket.refill_rate,
                sent_this_window: bucket.sent_this_window,
            }
        })
    }

    /// Number of tenants with a live bucket
    #[must_use]
    pub fn tenant_count(&self) -> usize {
        self.buckets.len()
    }
}

/// Statistics for one bucket
#[derive(Debug, Clone)]
pub struct RateLimitStats {
    /// Currently available tokens
    pub available_tokens: f64,
    /// Maximum capacity (burst size)
    pub capacity: f64,
    /// Refill rate (tokens per second)
    pub refill_rate: f64,
    /// Admissions granted in the current 60 second window
    pub sent_this_window: u64,
}
