//! Outbound dispatch metrics
//!
//! Tracks the message pipeline end to end:
//! - Attempt counts by outcome
//! - Send latency and time spent queued
//! - Queue sizes by lifecycle status
//! - Rate limiter and circuit breaker activity
//! - In-flight sends

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter, UpDownCounter},
};

/// Dispatch metrics collector
#[derive(Debug)]
pub struct DispatchMetrics {
    /// Total number of send attempts by outcome
    attempts_total: Counter<u64>,

    /// Total number of messages accepted into the queue
    messages_enqueued: Counter<u64>,

    /// Total number of messages delivered to the provider
    messages_sent: Counter<u64>,

    /// Total number of messages terminally failed
    messages_failed: Counter<u64>,

    /// Total number of retry attempts scheduled
    messages_retried: Counter<u64>,

    /// Total number of messages expired before delivery
    messages_expired: Counter<u64>,

    /// Total number of messages cancelled by the producer
    messages_cancelled: Counter<u64>,

    /// Total number of sends declined by the rate limiter
    rate_limited_total: Counter<u64>,

    /// Distribution of rate limiter wait hints
    rate_limit_wait_seconds: Histogram<f64>,

    /// Distribution of provider send durations
    send_duration_seconds: Histogram<f64>,

    /// Distribution of time between enqueue and delivery
    queue_time_seconds: Histogram<f64>,

    /// Distribution of retry counts before success
    retry_count: Histogram<u64>,

    /// Total number of circuit breaker transitions
    circuit_transitions: Counter<u64>,

    /// Number of sends currently in flight
    inflight_sends: UpDownCounter<i64>,

    // Local counters for queue size tracking (shared with the gauge callback)
    queue_queued: Arc<AtomicU64>,
    queue_rate_limited: Arc<AtomicU64>,
    queue_sending: Arc<AtomicU64>,
    queue_sent: Arc<AtomicU64>,
    queue_failed: Arc<AtomicU64>,
    queue_expired: Arc<AtomicU64>,
    queue_cancelled: Arc<AtomicU64>,
    inflight_count: AtomicU64,
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchMetrics {
    /// Create a new dispatch metrics collector
    #[must_use]
    pub fn new() -> Self {
        let meter = meter();

        let attempts_total = meter
            .u64_counter("courier.dispatch.attempts.total")
            .with_description("Total number of send attempts by outcome")
            .build();

        let messages_enqueued = meter
            .u64_counter("courier.dispatch.messages.enqueued.total")
            .with_description("Total number of messages accepted into the queue")
            .build();

        let messages_sent = meter
            .u64_counter("courier.dispatch.messages.sent.total")
            .with_description("Total number of messages delivered to the provider")
            .build();

        let messages_failed = meter
            .u64_counter("courier.dispatch.messages.failed.total")
            .with_description("Total number of messages terminally failed")
            .build();

        let messages_retried = meter
            .u64_counter("courier.dispatch.messages.retried.total")
            .with_description("Total number of retry attempts scheduled")
            .build();

        let messages_expired = meter
            .u64_counter("courier.dispatch.messages.expired.total")
            .with_description("Total number of messages expired before delivery")
            .build();

        let messages_cancelled = meter
            .u64_counter("courier.dispatch.messages.cancelled.total")
            .with_description("Total number of messages cancelled by the producer")
            .build();

        let rate_limited_total = meter
            .u64_counter("courier.dispatch.rate_limited.total")
            .with_description("Total number of sends declined by the rate limiter")
            .build();

        let rate_limit_wait_seconds = meter
            .f64_histogram("courier.dispatch.rate_limit.wait.seconds")
            .with_description("Distribution of rate limiter wait hints")
            .build();

        let send_duration_seconds = meter
            .f64_histogram("courier.dispatch.send.duration.seconds")
            .with_description("Distribution of provider send durations")
            .build();

        let queue_time_seconds = meter
            .f64_histogram("courier.dispatch.queue.time.seconds")
            .with_description("Distribution of time between enqueue and delivery")
            .build();

        let retry_count = meter
            .u64_histogram("courier.dispatch.retry.count")
            .with_description("Distribution of retry counts before success")
            .build();

        let circuit_transitions = meter
            .u64_counter("courier.dispatch.circuit.transitions.total")
            .with_description("Total number of circuit breaker transitions")
            .build();

        let inflight_sends = meter
            .i64_up_down_counter("courier.dispatch.sends.inflight")
            .with_description("Number of sends currently in flight")
            .build();

        // Atomic counters for queue size tracking (Arc-shared with the gauge)
        let queue_queued = Arc::new(AtomicU64::new(0));
        let queue_rate_limited = Arc::new(AtomicU64::new(0));
        let queue_sending = Arc::new(AtomicU64::new(0));
        let queue_sent = Arc::new(AtomicU64::new(0));
        let queue_failed = Arc::new(AtomicU64::new(0));
        let queue_expired = Arc::new(AtomicU64::new(0));
        let queue_cancelled = Arc::new(AtomicU64::new(0));

        let by_status: [(&'static str, Arc<AtomicU64>); 7] = [
            ("queued", queue_queued.clone()),
            ("rate_limited", queue_rate_limited.clone()),
            ("sending", queue_sending.clone()),
            ("sent", queue_sent.clone()),
            ("failed", queue_failed.clone()),
            ("expired", queue_expired.clone()),
            ("cancelled", queue_cancelled.clone()),
        ];

        // The meter keeps the gauge alive internally via the callback
        meter
            .u64_observable_gauge("courier.dispatch.queue.size")
            .with_description("Current queue size by status")
            .with_callback(move |observer| {
                for (status, count) in &by_status {
                    observer.observe(
                        count.load(Ordering::Relaxed),
                        &[KeyValue::new("status", *status)],
                    );
                }
            })
            .build();

        Self {
            attempts_total,
            messages_enqueued,
            messages_sent,
            messages_failed,
            messages_retried,
            messages_expired,
            messages_cancelled,
            rate_limited_total,
            rate_limit_wait_seconds,
            send_duration_seconds,
            queue_time_seconds,
            retry_count,
            circuit_transitions,
            inflight_sends,
            queue_queued,
            queue_rate_limited,
            queue_sending,
            queue_sent,
            queue_failed,
            queue_expired,
            queue_cancelled,
            inflight_count: AtomicU64::new(0),
        }
    }

    /// Record a send attempt outcome
    pub fn record_attempt(&self, outcome: &str, tenant: &str) {
        let attributes = [
            KeyValue::new("outcome", outcome.to_string()),
            KeyValue::new("tenant", tenant.to_string()),
        ];
        self.attempts_total.add(1, &attributes);
    }

    /// Record a message accepted into the queue
    pub fn record_enqueued(&self, tenant: &str, priority: &str) {
        let attributes = [
            KeyValue::new("tenant", tenant.to_string()),
            KeyValue::new("priority", priority.to_string()),
        ];
        self.messages_enqueued.add(1, &attributes);
    }

    /// Record a successful delivery
    pub fn record_send_success(
        &self,
        tenant: &str,
        duration_secs: f64,
        queue_secs: f64,
        retry_count: u64,
    ) {
        let attributes = [KeyValue::new("tenant", tenant.to_string())];
        self.send_duration_seconds.record(duration_secs, &attributes);
        self.queue_time_seconds.record(queue_secs, &[]);
        self.retry_count.record(retry_count, &[]);
        self.messages_sent.add(1, &[]);
        self.record_attempt("success", tenant);
    }

    /// Record a terminal delivery failure
    pub fn record_send_failure(&self, tenant: &str, reason: &str) {
        let attributes = [KeyValue::new("reason", reason.to_string())];
        self.messages_failed.add(1, &attributes);
        self.record_attempt("failed", tenant);
    }

    /// Record a scheduled retry
    pub fn record_retry(&self, tenant: &str) {
        self.messages_retried.add(1, &[]);
        self.record_attempt("retry", tenant);
    }

    /// Record a rate limiter decline
    ///
    /// `scope` is `"tenant"` or `"global"` depending on which bucket declined.
    pub fn record_rate_limited(&self, tenant: &str, scope: &str, wait_secs: f64) {
        let attributes = [
            KeyValue::new("tenant", tenant.to_string()),
            KeyValue::new("scope", scope.to_string()),
        ];
        self.rate_limited_total.add(1, &attributes);
        self.rate_limit_wait_seconds.record(wait_secs, &[]);
    }

    /// Record a message expiry
    pub fn record_expired(&self, tenant: &str) {
        let attributes = [KeyValue::new("tenant", tenant.to_string())];
        self.messages_expired.add(1, &attributes);
    }

    /// Record a producer cancellation
    pub fn record_cancelled(&self, tenant: &str) {
        let attributes = [KeyValue::new("tenant", tenant.to_string())];
        self.messages_cancelled.add(1, &attributes);
    }

    /// Record a circuit breaker transition into `state`
    pub fn record_circuit_transition(&self, state: &str) {
        let attributes = [KeyValue::new("state", state.to_string())];
        self.circuit_transitions.add(1, &attributes);
    }

    /// Record a send entering flight
    pub fn record_send_started(&self) {
        self.inflight_sends.add(1, &[]);
        self.inflight_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a send leaving flight
    pub fn record_send_finished(&self) {
        self.inflight_sends.add(-1, &[]);
        self.inflight_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get the current number of in-flight sends
    #[must_use]
    pub fn inflight(&self) -> u64 {
        self.inflight_count.load(Ordering::Relaxed)
    }

    /// Set absolute queue size for a specific status
    pub fn set_queue_size(&self, status: &str, size: u64) {
        if let Some(counter) = self.queue_counter(status) {
            counter.store(size, Ordering::Relaxed);
        }
    }

    /// Get current queue size for a status
    #[must_use]
    pub fn get_queue_size(&self, status: &str) -> u64 {
        self.queue_counter(status)
            .map_or(0, |counter| counter.load(Ordering::Relaxed))
    }

    fn queue_counter(&self, status: &str) -> Option<&Arc<AtomicU64>> {
        match status {
            "queued" => Some(&self.queue_queued),
            "rate_limited" => Some(&self.queue_rate_limited),
            "sending" => Some(&self.queue_sending),
            "sent" => Some(&self.queue_sent),
            "failed" => Some(&self.queue_failed),
            "expired" => Some(&self.queue_expired),
            "cancelled" => Some(&self.queue_cancelled),
            _ => None,
        }
    }
}

/// Get the OpenTelemetry meter for dispatch metrics
fn meter() -> Meter {
    opentelemetry::global::meter("courier.dispatch")
}
