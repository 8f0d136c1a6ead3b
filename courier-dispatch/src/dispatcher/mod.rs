//! Dispatch loop orchestration

pub mod process;

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use courier_common::{Signal, internal};
use serde::Deserialize;
use tokio::task::JoinSet;

use crate::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState},
    error::DispatchError,
    events::{DispatchEvent, EventBus},
    message::{MessageStatus, QueuedMessage},
    queue::{MessageQueue, retry::RetryPolicy},
    rate_limiter::{RateLimitConfig, RateLimiter},
    stats::HealthThresholds,
    transport::Transport,
};

fn default_max_concurrent_dispatches() -> usize {
    num_cpus::get()
}

const fn default_transport_timeout() -> u64 {
    10_000 // 10 seconds
}

const fn default_housekeeping_interval() -> u64 {
    5
}

const fn default_retention() -> u64 {
    3600 // 1 hour
}

const fn default_idle_eviction() -> u64 {
    600 // 10 minutes
}

/// Dispatcher for draining the message queue against the provider
///
/// The dispatcher runs continuously, claiming eligible messages as
/// concurrency slots open up and handing each one to the transport under
/// the rate limiter and circuit breaker.
#[derive(Debug, Deserialize)]
pub struct Dispatcher {
    /// Maximum number of in-flight transport calls
    ///
    /// Default: the number of CPUs
    #[serde(default = "default_max_concurrent_dispatches")]
    pub max_concurrent_dispatches: usize,

    /// Per-attempt deadline for a single transport call (in milliseconds)
    ///
    /// An attempt that outlives this deadline is treated as a transient
    /// failure regardless of what the provider eventually did.
    ///
    /// Default: 10000 (10 seconds)
    #[serde(default = "default_transport_timeout")]
    pub transport_timeout_ms: u64,

    /// How often to run expiry, retention, and eviction sweeps (in seconds)
    ///
    /// Default: 5
    #[serde(default = "default_housekeeping_interval")]
    pub housekeeping_interval_secs: u64,

    /// How long terminal messages stay queryable (in seconds)
    ///
    /// Default: 3600 (1 hour)
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// How long an unused tenant rate bucket survives (in seconds)
    ///
    /// Default: 600 (10 minutes)
    #[serde(default = "default_idle_eviction")]
    pub idle_eviction_secs: u64,

    /// Token bucket configuration for the account and its tenants
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Circuit breaker thresholds and timings
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Backoff schedule and default retry budget
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Queue depth and failure rate cutoffs for health reporting
    #[serde(default)]
    pub health: HealthThresholds,

    /// The message queue this dispatcher drains
    #[serde(skip)]
    pub(crate) queue: Arc<MessageQueue>,

    /// The provider transport (initialized in `init()`)
    #[serde(skip)]
    pub(crate) transport: Option<Arc<dyn Transport>>,

    /// Two-level token bucket limiter (initialized in `init()`)
    #[serde(skip)]
    pub(crate) limiter: Option<RateLimiter>,

    /// Provider health circuit breaker (initialized in `init()`)
    #[serde(skip)]
    pub(crate) breaker: Option<CircuitBreaker>,

    /// Lifecycle event fan-out
    #[serde(skip)]
    pub(crate) events: EventBus,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self {
            max_concurrent_dispatches: default_max_concurrent_dispatches(),
            transport_timeout_ms: default_transport_timeout(),
            housekeeping_interval_secs: default_housekeeping_interval(),
            retention_secs: default_retention(),
            idle_eviction_secs: default_idle_eviction(),
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
            health: HealthThresholds::default(),
            queue: Arc::new(MessageQueue::new()),
            transport: None,
            limiter: None,
            breaker: None,
            events: EventBus::new(),
        }
    }
}

impl Dispatcher {
    /// Initialize the dispatcher with its transport
    ///
    /// Builds the rate limiter and circuit breaker from the configured
    /// settings. Must be called before [`serve`](Self::serve).
    pub fn init(&mut self, transport: Arc<dyn Transport>) {
        internal!("Initialising dispatcher ...");
        self.transport = Some(transport);
        self.limiter = Some(RateLimiter::new(self.rate_limit.clone()));
        self.breaker = Some(CircuitBreaker::new(self.circuit_breaker.clone()));
        internal!(
            "Rate limiter initialized with global={}/s burst={}, tenant={}/s burst={}, {} tenant overrides",
            self.rate_limit.messages_per_second,
            self.rate_limit.burst_size,
            self.rate_limit.tenant_messages_per_second,
            self.rate_limit.tenant_burst_size,
            self.rate_limit.tenant_limits.len()
        );
        internal!(
            "Circuit breaker initialized with failure_threshold={}, success_threshold={}, open_duration={}ms",
            self.circuit_breaker.failure_threshold,
            self.circuit_breaker.success_threshold,
            self.circuit_breaker.open_duration_ms
        );
    }

    /// Run the dispatch loop
    ///
    /// This method runs continuously until a shutdown signal is received.
    /// It wakes on enqueues, on retry and rate limit timers, and on worker
    /// completion, claiming as many eligible messages as concurrency and
    /// admission allow.
    ///
    /// ## Graceful Shutdown
    ///
    /// When a shutdown signal is received:
    /// 1. Stop claiming new messages
    /// 2. Wait for in-flight sends to complete (with 30s timeout)
    /// 3. Exit cleanly
    ///
    /// # Errors
    ///
    /// Returns an error if [`init`](Self::init) was never called.
    pub async fn serve(
        self: Arc<Self>,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), DispatchError> {
        internal!("Dispatcher starting");

        let Some(transport) = self.transport.clone() else {
            return Err(DispatchError::NotInitialized(
                "Dispatcher not initialized. Call init() first.".to_string(),
            ));
        };

        let mut housekeeping =
            tokio::time::interval(Duration::from_secs(self.housekeeping_interval_secs));

        // Skip the first tick to avoid immediate execution
        housekeeping.tick().await;

        let mut workers: JoinSet<()> = JoinSet::new();
        let mut last_circuit = CircuitState::Closed;

        loop {
            let next_wake = process::pump(&self, &transport, &mut workers, &mut last_circuit);
            let wake_delay =
                next_wake.map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO));

            tokio::select! {
                () = self.queue.notified() => {}
                () = tokio::time::sleep(wake_delay.unwrap_or(Duration::ZERO)), if wake_delay.is_some() => {}
                _ = housekeeping.tick() => {
                    self.housekeeping_pass();
                }
                Some(result) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = result {
                        tracing::error!("Dispatch worker panicked: {e}");
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!("Dispatcher received shutdown signal");

                            // Wait for in-flight sends to complete (with 30s timeout)
                            let shutdown_timeout = Duration::from_secs(30);
                            let start = std::time::Instant::now();

                            while !workers.is_empty() {
                                if start.elapsed() >= shutdown_timeout {
                                    tracing::warn!(
                                        "Shutdown timeout exceeded, aborting {} remaining in-flight sends",
                                        workers.len()
                                    );
                                    workers.abort_all();
                                    break;
                                }

                                if tokio::time::timeout(
                                    Duration::from_millis(100),
                                    workers.join_next(),
                                )
                                .await
                                .is_err()
                                {
                                    tracing::debug!(
                                        "Waiting for {} in-flight sends to complete ({:.1}s elapsed)...",
                                        workers.len(),
                                        start.elapsed().as_secs_f64()
                                    );
                                }
                            }

                            if workers.is_empty() {
                                internal!("All in-flight sends completed");
                            }

                            internal!("Dispatcher shutdown complete");
                            break;
                        }
                        Err(e) => {
                            tracing::error!("Dispatcher shutdown channel error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Expiry, retention, bucket eviction, and gauge refresh
    ///
    /// Runs on the housekeeping interval. The claim path also sweeps
    /// expired messages it encounters; this pass catches the ones nothing
    /// tried to claim.
    fn housekeeping_pass(&self) {
        let now = Utc::now();

        let expired = self.queue.expire_due(now);
        self.note_expired(&expired);

        let purged = self
            .queue
            .purge_terminal(now, Duration::from_secs(self.retention_secs));
        if purged > 0 {
            tracing::debug!(purged, "Dropped terminal messages past the retention window");
        }

        if let Some(limiter) = &self.limiter {
            let evicted = limiter.evict_idle(Duration::from_secs(self.idle_eviction_secs));
            if evicted > 0 {
                tracing::debug!(evicted, "Evicted idle tenant rate buckets");
            }
        }

        if let Some(metrics) = courier_metrics::try_metrics() {
            let counts = self.queue.status_counts();
            metrics
                .dispatch
                .set_queue_size(MessageStatus::Queued.as_str(), counts.queued);
            metrics
                .dispatch
                .set_queue_size(MessageStatus::RateLimited.as_str(), counts.rate_limited);
            metrics
                .dispatch
                .set_queue_size(MessageStatus::Sending.as_str(), counts.sending);
            metrics
                .dispatch
                .set_queue_size(MessageStatus::Sent.as_str(), counts.sent);
            metrics
                .dispatch
                .set_queue_size(MessageStatus::Failed.as_str(), counts.failed);
            metrics
                .dispatch
                .set_queue_size(MessageStatus::Expired.as_str(), counts.expired);
            metrics
                .dispatch
                .set_queue_size(MessageStatus::Cancelled.as_str(), counts.cancelled);
        }
    }

    /// Publish and count messages that passed their deadline
    pub(crate) fn note_expired(&self, expired: &[QueuedMessage]) {
        for message in expired {
            tracing::warn!(
                message_id = %message.id,
                tenant_id = %message.tenant_id,
                "Message passed its expiry deadline, marking as Expired"
            );
            self.events.emit(DispatchEvent::Expired {
                id: message.id,
                tenant_id: message.tenant_id.clone(),
            });
            if let Some(metrics) = courier_metrics::try_metrics() {
                metrics.dispatch.record_expired(message.tenant_id.as_str());
            }
        }
    }

    /// Get a reference to the message queue
    pub const fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    /// Get a reference to the event bus
    pub const fn events(&self) -> &EventBus {
        &self.events
    }
}
