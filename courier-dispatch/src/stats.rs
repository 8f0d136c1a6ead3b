//! Queue statistics and health reporting

use ahash::AHashMap;
use chrono::{DateTime, Duration, Utc};
use courier_common::TenantId;
use serde::{Deserialize, Serialize};

/// Message counts per lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub queued: u64,
    pub rate_limited: u64,
    pub sending: u64,
    pub sent: u64,
    pub failed: u64,
    pub expired: u64,
    pub cancelled: u64,
}

impl StatusCounts {
    /// Messages still moving through the pipeline
    #[must_use]
    pub const fn active(&self) -> u64 {
        self.queued + self.rate_limited + self.sending
    }

    /// Every record currently retained
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.active() + self.sent + self.failed + self.expired + self.cancelled
    }
}

/// Active message counts per priority class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PriorityCounts {
    pub urgent: u64,
    pub high: u64,
    pub normal: u64,
    pub low: u64,
}

/// Coarse health verdict for a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    /// Depth and failure rate are within normal bounds
    Healthy,
    /// Backlog or failures are elevated; keep an eye on it
    Degraded,
    /// The queue is falling behind badly or most sends fail
    Overloaded,
}

impl Health {
    /// Judge a queue from its depth and recent failure rate
    #[must_use]
    pub fn evaluate(depth: u64, failure_rate: f64, thresholds: &HealthThresholds) -> Self {
        if depth >= thresholds.overloaded_depth
            || failure_rate >= thresholds.overloaded_failure_rate
        {
            Self::Overloaded
        } else if depth >= thresholds.degraded_depth
            || failure_rate >= thresholds.degraded_failure_rate
        {
            Self::Degraded
        } else {
            Self::Healthy
        }
    }
}

/// Cutoffs separating healthy, degraded, and overloaded queues
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthThresholds {
    /// Active depth at which the queue reads as degraded
    #[serde(default = "default_degraded_depth")]
    pub degraded_depth: u64,

    /// Active depth at which the queue reads as overloaded
    #[serde(default = "default_overloaded_depth")]
    pub overloaded_depth: u64,

    /// Failure rate (0..1) at which the queue reads as degraded
    #[serde(default = "default_degraded_failure_rate")]
    pub degraded_failure_rate: f64,

    /// Failure rate (0..1) at which the queue reads as overloaded
    #[serde(default = "default_overloaded_failure_rate")]
    pub overloaded_failure_rate: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_depth: default_degraded_depth(),
            overloaded_depth: default_overloaded_depth(),
            degraded_failure_rate: default_degraded_failure_rate(),
            overloaded_failure_rate: default_overloaded_failure_rate(),
        }
    }
}

const fn default_degraded_depth() -> u64 {
    500
}

const fn default_overloaded_depth() -> u64 {
    2_000
}

const fn default_degraded_failure_rate() -> f64 {
    0.1
}

const fn default_overloaded_failure_rate() -> f64 {
    0.5
}

/// Point-in-time view of queue load and recent outcomes
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatistics {
    /// Messages still moving through the pipeline
    pub depth: u64,
    /// Counts per lifecycle status, terminal records included
    pub by_status: StatusCounts,
    /// Active messages per priority class
    pub by_priority: PriorityCounts,
    /// Successful sends in the last minute
    pub sent_last_minute: u64,
    /// Successful sends in the last hour
    pub sent_last_hour: u64,
    /// Sends per second over the last minute
    pub throughput_per_sec: f64,
    /// Mean time from enqueue to successful send, over the last hour
    pub avg_queue_time_ms: Option<f64>,
    /// Failures / (failures + sends) over the last minute
    pub failure_rate: f64,
    /// Overall verdict from depth and failure rate
    pub health: Health,
}

/// Rolling send/failure history for one scope (global or a tenant)
#[derive(Debug, Default)]
struct WindowStats {
    /// Successful sends: (completed at, enqueue-to-send milliseconds)
    sent: std::collections::VecDeque<(DateTime<Utc>, i64)>,
    /// Terminal or retried failures by completion time
    failures: std::collections::VecDeque<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
}

impl WindowStats {
    fn record_sent(&mut self, at: DateTime<Utc>, queue_ms: i64) {
        self.sent.push_back((at, queue_ms));
        self.last_success_at = Some(at);
    }

    fn record_failure(&mut self, at: DateTime<Utc>, error: &str) {
        self.failures.push_back(at);
        self.last_error = Some(error.to_string());
        self.last_error_at = Some(at);
    }

    /// Drop history older than one hour
    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::hours(1);
        while self.sent.front().is_some_and(|(at, _)| *at < cutoff) {
            self.sent.pop_front();
        }
        while self.failures.front().is_some_and(|at| *at < cutoff) {
            self.failures.pop_front();
        }
    }

    fn snapshot(&mut self, now: DateTime<Utc>) -> WindowSnapshot {
        self.prune(now);

        let minute_cutoff = now - Duration::minutes(1);
        let sent_last_minute = self
            .sent
            .iter()
            .filter(|(at, _)| *at >= minute_cutoff)
            .count() as u64;
        let sent_last_hour = self.sent.len() as u64;

        let failures_last_minute = self
            .failures
            .iter()
            .filter(|at| **at >= minute_cutoff)
            .count() as u64;

        let outcomes = sent_last_minute + failures_last_minute;
        #[allow(clippy::cast_precision_loss)]
        let failure_rate = if outcomes == 0 {
            0.0
        } else {
            failures_last_minute as f64 / outcomes as f64
        };

        #[allow(clippy::cast_precision_loss)]
        let avg_queue_time_ms = (!self.sent.is_empty()).then(|| {
            let total: i64 = self.sent.iter().map(|(_, queue_ms)| *queue_ms).sum();
            total as f64 / self.sent.len() as f64
        });

        #[allow(clippy::cast_precision_loss)]
        let throughput_per_sec = sent_last_minute as f64 / 60.0;

        WindowSnapshot {
            sent_last_minute,
            sent_last_hour,
            throughput_per_sec,
            avg_queue_time_ms,
            failure_rate,
            last_success_at: self.last_success_at,
            last_error: self.last_error.clone(),
            last_error_at: self.last_error_at,
        }
    }
}

/// Computed rolling-window numbers for one scope
#[derive(Debug, Clone)]
pub(crate) struct WindowSnapshot {
    pub sent_last_minute: u64,
    pub sent_last_hour: u64,
    pub throughput_per_sec: f64,
    pub avg_queue_time_ms: Option<f64>,
    pub failure_rate: f64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

/// Send/failure history, per tenant and overall
#[derive(Debug, Default)]
pub(crate) struct StatsBook {
    global: WindowStats,
    tenants: AHashMap<TenantId, WindowStats>,
}

impl StatsBook {
    pub fn record_sent(&mut self, tenant: &TenantId, at: DateTime<Utc>, queue_ms: i64) {
        self.global.record_sent(at, queue_ms);
        self.tenants
            .entry(tenant.clone())
            .or_default()
            .record_sent(at, queue_ms);
    }

    pub fn record_failure(&mut self, tenant: &TenantId, at: DateTime<Utc>, error: &str) {
        self.global.record_failure(at, error);
        self.tenants
            .entry(tenant.clone())
            .or_default()
            .record_failure(at, error);
    }

    /// Rolling numbers for one tenant, or for everything when `None`
    pub fn snapshot(&mut self, tenant: Option<&TenantId>, now: DateTime<Utc>) -> WindowSnapshot {
        match tenant {
            Some(tenant) => self
                .tenants
                .get_mut(tenant)
                .map_or_else(|| WindowStats::default().snapshot(now), |w| w.snapshot(now)),
            None => self.global.snapshot(now),
        }
    }

    /// Drop tenant entries whose whole history aged out
    pub fn prune(&mut self, now: DateTime<Utc>) {
        self.global.prune(now);
        self.tenants.retain(|_, window| {
            window.prune(now);
            !(window.sent.is_empty() && window.failures.is_empty())
        });
    }
}
