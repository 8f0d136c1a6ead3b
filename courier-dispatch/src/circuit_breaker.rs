//! Circuit breaker guarding the upstream messaging provider
//!
//! Implements the circuit breaker pattern to stop hammering the provider
//! when it is down or degraded. Failures that say nothing about provider
//! health (bad payloads, bad credentials) never move the circuit; see
//! [`ErrorKind::affects_circuit`].
//!
//! # Circuit Breaker Pattern
//!
//! The circuit breaker has three states:
//! - **Closed**: Normal operation, all sends allowed
//! - **Open**: Circuit tripped due to failures, all sends rejected immediately
//! - **Half-Open**: Testing recovery, a few probe sends allowed through
//!
//! # State Transitions
//!
//! ```text
//! ┌─────────┐  Consecutive failures hit threshold  ┌──────┐
//! │ Closed  │ ───────────────────────────────────> │ Open │
//! └─────────┘                                      └──────┘
//!     ^                                               │
//!     │                                               │ Open duration elapsed
//!     │                                               v
//!     │  Enough probe successes       ┌───────────────┐
//!     └──────────────────────────────│   Half-Open    │
//!                                     └───────────────┘
//!                                             │
//!                                             │ Any probe failure
//!                                             v
//!                                       ┌──────┐
//!                                       │ Open │
//!                                       └──────┘
//! ```
//!
//! # Example
//!
//! ```text
//! Threshold: 5 consecutive failures
//! Open duration: 30 seconds
//!
//! t=0s:   Closed (normal)
//! t=10s:  5 failures → Open (circuit trips)
//! t=10s-40s: All sends rejected immediately (no wasted provider calls)
//! t=40s:  Half-Open (up to 3 probe sends allowed)
//! t=41s:  3 probes succeed → Closed (normal operation resumes)
//! ```

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    classify::classify,
    error::{DispatchError, TransportError},
};

/// How many recent outcomes feed the health sample
const SAMPLE_CAPACITY: usize = 100;

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive half-open successes needed to close the circuit
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// How long the circuit stays open before testing recovery (milliseconds)
    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,

    /// Probe sends allowed in flight at once while half-open
    #[serde(default = "default_half_open_requests")]
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_duration_ms: default_open_duration_ms(),
            half_open_requests: default_half_open_requests(),
        }
    }
}

const fn default_failure_threshold() -> u32 {
    5 // Trip circuit after 5 consecutive failures
}

const fn default_success_threshold() -> u32 {
    3 // Close circuit after 3 consecutive half-open successes
}

const fn default_open_duration_ms() -> u64 {
    30_000
}

const fn default_half_open_requests() -> u32 {
    3
}

impl CircuitBreakerConfig {
    /// Open duration as a [`Duration`]
    #[must_use]
    pub const fn open_duration(&self) -> Duration {
        Duration::from_millis(self.open_duration_ms)
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, all sends allowed
    Closed,
    /// Circuit tripped, reject all sends immediately
    Open,
    /// Testing recovery, limited probe sends allowed
    HalfOpen,
}

impl CircuitState {
    /// Stable lowercase name, matching the serialized form
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable breaker state, behind one lock
#[derive(Debug)]
struct BreakerInner {
    /// Current state of the circuit
    state: CircuitState,
    /// Consecutive circuit-affecting failures
    consecutive_failures: u32,
    /// Consecutive successes while half-open
    consecutive_successes: u32,
    /// When the circuit last opened
    opened_at: Option<Instant>,
    /// Probe sends currently in flight while half-open
    half_open_inflight: u32,
    /// Rolling sample of recent outcomes: (succeeded, latency)
    sample: VecDeque<(bool, Option<Duration>)>,
}

impl BreakerInner {
    const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            half_open_inflight: 0,
            sample: VecDeque::new(),
        }
    }

    fn push_sample(&mut self, succeeded: bool, latency: Option<Duration>) {
        if self.sample.len() == SAMPLE_CAPACITY {
            self.sample.pop_front();
        }
        self.sample.push_back((succeeded, latency));
    }

    /// Move Open to HalfOpen once the open duration has elapsed
    fn maybe_half_open(&mut self, open_duration: Duration) {
        if self.state == CircuitState::Open
            && self
                .opened_at
                .is_some_and(|opened| opened.elapsed() >= open_duration)
        {
            self.state = CircuitState::HalfOpen;
            self.consecutive_successes = 0;
            self.half_open_inflight = 0;
            tracing::info!("Circuit breaker entering HALF-OPEN state - testing recovery");
        }
    }

    fn trip(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.consecutive_successes = 0;
        self.half_open_inflight = 0;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.opened_at = None;
        self.half_open_inflight = 0;
    }

    /// When the open period lapses, if currently open
    fn next_retry_at(&self, open_duration: Duration) -> Option<DateTime<Utc>> {
        if self.state != CircuitState::Open {
            return None;
        }

        self.opened_at.map(|opened| {
            let remaining = open_duration.saturating_sub(opened.elapsed());
            Utc::now()
                + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero())
        })
    }
}

/// Circuit breaker for the single upstream provider
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: parking_lot::Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in the closed state
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: parking_lot::Mutex::new(BreakerInner::new()),
        }
    }

    /// Current state, applying the open-duration timeout lazily
    ///
    /// Reading the state never consumes a half-open probe slot; use
    /// [`Self::can_request`] to reserve one.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        inner.maybe_half_open(self.config.open_duration());
        inner.state
    }

    /// Check whether a send may proceed, reserving a probe slot if half-open
    ///
    /// Returns `true` if the send should be attempted. Every `true` returned
    /// while half-open must be matched by a later [`Self::record_success`] or
    /// [`Self::record_failure`], or probe slots leak until the next trip.
    pub fn can_request(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.maybe_half_open(self.config.open_duration());

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.half_open_inflight < self.config.half_open_requests {
                    inner.half_open_inflight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Probe slots still available right now, without reserving any
    ///
    /// `None` means the breaker is not limiting concurrency (closed state).
    pub fn available_probes(&self) -> Option<u32> {
        let mut inner = self.inner.lock();
        inner.maybe_half_open(self.config.open_duration());

        match inner.state {
            CircuitState::Closed => None,
            CircuitState::Open => Some(0),
            CircuitState::HalfOpen => Some(
                self.config
                    .half_open_requests
                    .saturating_sub(inner.half_open_inflight),
            ),
        }
    }

    /// Record a successful send
    ///
    /// Returns `true` if the circuit transitioned to Closed (recovered)
    pub fn record_success(&self, latency: Option<Duration>) -> bool {
        let mut inner = self.inner.lock();
        inner.push_sample(true, latency);

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                false
            }
            CircuitState::HalfOpen => {
                inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
                inner.consecutive_successes += 1;

                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.close();
                    tracing::info!("Circuit breaker CLOSED - normal operation resumed");
                    true
                } else {
                    false
                }
            }
            CircuitState::Open => {
                // A send that was already in flight when the circuit tripped
                tracing::debug!("Success recorded while circuit is open");
                false
            }
        }
    }

    /// Record a failed send that counts against provider health
    ///
    /// Returns `true` if the circuit transitioned to Open (tripped)
    pub fn record_failure(&self, latency: Option<Duration>) -> bool {
        let mut inner = self.inner.lock();
        inner.push_sample(false, latency);

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;

                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.trip();
                    tracing::warn!(
                        consecutive_failures = inner.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        open_duration_ms = self.config.open_duration_ms,
                        "Circuit breaker OPENED - rejecting sends to let the provider recover"
                    );
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                // A probe failed, the provider is still unhealthy
                inner.trip();
                tracing::warn!("Circuit breaker probe failed - reopening circuit");
                true
            }
            CircuitState::Open => false,
        }
    }

    /// Earliest time a send could be allowed again, if the circuit is open
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        let mut inner = self.inner.lock();
        inner.maybe_half_open(self.config.open_duration());
        inner.next_retry_at(self.config.open_duration())
    }

    /// Run `op` under the breaker's protection
    ///
    /// Rejects immediately with [`DispatchError::CircuitOpen`] when the
    /// circuit disallows the send. Otherwise runs the operation, records its
    /// outcome (failures only when they reflect provider health), and
    /// returns the result.
    ///
    /// # Errors
    ///
    /// [`DispatchError::CircuitOpen`] when rejected without calling `op`,
    /// or the operation's own [`TransportError`] passed through.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        if !self.can_request() {
            let next_retry_at = self.next_retry_at().unwrap_or_else(Utc::now);
            return Err(DispatchError::CircuitOpen { next_retry_at });
        }

        let started = Instant::now();
        let result = op().await;
        let latency = started.elapsed();

        match result {
            Ok(value) => {
                self.record_success(Some(latency));
                Ok(value)
            }
            Err(error) => {
                if classify(&error).affects_circuit() {
                    self.record_failure(Some(latency));
                } else {
                    // The probe completed; its verdict is just neutral
                    let mut inner = self.inner.lock();
                    if inner.state == CircuitState::HalfOpen {
                        inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
                    }
                }
                Err(error.into())
            }
        }
    }

    /// Force the circuit into a specific state (operator override)
    pub fn force_state(&self, state: CircuitState) {
        let mut inner = self.inner.lock();

        match state {
            CircuitState::Closed => inner.close(),
            CircuitState::Open => inner.trip(),
            CircuitState::HalfOpen => {
                inner.state = CircuitState::HalfOpen;
                inner.consecutive_successes = 0;
                inner.half_open_inflight = 0;
            }
        }

        tracing::warn!(state = %state, "Circuit breaker state forced");
    }

    /// Reset to Closed with all counters and the health sample cleared
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = BreakerInner::new();
        tracing::info!("Circuit breaker reset");
    }

    /// Snapshot of breaker state and health sample (for monitoring)
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock();
        inner.maybe_half_open(self.config.open_duration());

        let sample_size = inner.sample.len();
        let success_rate = (sample_size > 0).then(|| {
            let successes = inner.sample.iter().filter(|(ok, _)| *ok).count();
            successes as f64 / sample_size as f64
        });

        let latencies: Vec<Duration> = inner
            .sample
            .iter()
            .filter_map(|(_, latency)| *latency)
            .collect();
        let avg_latency_ms = (!latencies.is_empty()).then(|| {
            let total: Duration = latencies.iter().sum();
            total.as_secs_f64() * 1000.0 / latencies.len() as f64
        });

        let next_retry_at = inner.next_retry_at(self.config.open_duration());

        CircuitBreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            sample_size,
            success_rate,
            avg_latency_ms,
            next_retry_at,
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    /// Current circuit state
    pub state: CircuitState,
    /// Consecutive circuit-affecting failures
    pub consecutive_failures: u32,
    /// Consecutive successes while half-open
    pub consecutive_successes: u32,
    /// Outcomes currently in the health sample
    pub sample_size: usize,
    /// Fraction of sampled sends that succeeded
    pub success_rate: Option<f64>,
    /// Mean latency across sampled sends that reported one
    pub avg_latency_ms: Option<f64>,
    /// When the open period lapses, if currently open
    pub next_retry_at: Option<DateTime<Utc>>,
}
