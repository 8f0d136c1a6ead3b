//! Priority message queue
//!
//! Holds every in-flight [`QueuedMessage`] and decides which one dispatches
//! next. Ordering is strict priority, FIFO within a priority class, with
//! messages waiting out a backoff parked in a delay heap until due.
//!
//! All state lives behind one lock so that claiming a message and marking
//! it `Sending` is a single atomic step; two dispatch workers can never
//! claim the same message.

pub mod retry;

use std::{
    cmp::Reverse,
    collections::{BTreeMap, BinaryHeap},
    time::Duration,
};

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use courier_common::TenantId;
use tokio::sync::Notify;

use crate::{
    classify::ErrorKind,
    message::{AttemptOutcome, DispatchAttempt, MessageId, MessageStatus, Priority, QueuedMessage},
    rate_limiter::AdmitDecision,
    stats::{
        Health, HealthThresholds, PriorityCounts, QueueStatistics, StatsBook, StatusCounts,
    },
};

/// Ordering key within a priority lane: arrival time, then arrival sequence
type ReadyKey = (DateTime<Utc>, u64);

/// Heap entry for a message waiting out a delay
///
/// Entries are never removed early; `epoch` identifies the live one when a
/// message has been rescheduled or cancelled since the entry was pushed.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct DelayedEntry {
    scheduled_at: DateTime<Utc>,
    seq: u64,
    epoch: u64,
    id: MessageId,
}

/// A message parked by the rate limiter during a claim scan
#[derive(Debug, Clone)]
pub struct RateLimitStamp {
    pub id: MessageId,
    pub tenant_id: TenantId,
    /// When the message becomes eligible again
    pub resume_at: DateTime<Utc>,
}

/// Result of one claim scan
#[derive(Debug, Default)]
pub struct ClaimOutcome {
    /// The message now marked `Sending`, if any was admitted
    pub claimed: Option<QueuedMessage>,
    /// Messages whose deadline passed during the scan
    pub expired: Vec<QueuedMessage>,
    /// Messages parked because their tenant is over its rate
    pub rate_limited: Vec<RateLimitStamp>,
    /// Earliest time new work becomes eligible, for the dispatch loop's timer
    pub next_wake_at: Option<DateTime<Utc>>,
    /// The scan stopped because the shared account bucket is empty
    pub globally_limited: bool,
}

/// What to do with the head of a lane, decided while the record is borrowed
enum HeadAction {
    /// Entry points at a missing or non-claimable record
    Drop,
    Expired(QueuedMessage),
    Claimed(QueuedMessage),
    Park {
        entry: DelayedEntry,
        stamp: RateLimitStamp,
    },
    StopGlobal {
        resume_at: DateTime<Utc>,
    },
}

#[derive(Debug)]
struct QueueInner {
    /// Every retained record, active and recently terminal
    records: AHashMap<MessageId, QueuedMessage>,
    /// Dispatch-eligible messages, one FIFO lane per priority
    ready: [BTreeMap<ReadyKey, MessageId>; Priority::COUNT],
    /// Messages waiting out a backoff or rate limit delay
    delayed: BinaryHeap<Reverse<DelayedEntry>>,
    /// Rolling send/failure history
    stats: StatsBook,
    /// Next arrival sequence number
    next_seq: u64,
}

impl QueueInner {
    fn new() -> Self {
        Self {
            records: AHashMap::new(),
            ready: std::array::from_fn(|_| BTreeMap::new()),
            delayed: BinaryHeap::new(),
            stats: StatsBook::default(),
            next_seq: 0,
        }
    }

    /// Move delayed messages whose time has come into their ready lanes
    fn promote_due(&mut self, now: DateTime<Utc>) {
        loop {
            match self.delayed.peek() {
                Some(Reverse(top)) if top.scheduled_at <= now => {}
                _ => break,
            }
            let Some(Reverse(entry)) = self.delayed.pop() else {
                break;
            };

            let (lane, key) = {
                let Some(record) = self.records.get_mut(&entry.id) else {
                    continue;
                };
                if record.epoch != entry.epoch || !record.status.is_claimable() {
                    // Superseded by a newer reschedule or a cancel
                    continue;
                }
                if record.status == MessageStatus::RateLimited {
                    record.status = MessageStatus::Queued;
                }
                (record.priority.rank(), (record.created_at, record.seq))
            };

            self.ready[lane].insert(key, entry.id);
        }
    }

    fn claim_next<G>(&mut self, now: DateTime<Utc>, gate: &mut G) -> ClaimOutcome
    where
        G: FnMut(MessageId, &TenantId) -> AdmitDecision,
    {
        let mut outcome = ClaimOutcome::default();
        self.promote_due(now);

        'lanes: for lane in 0..Priority::COUNT {
            while let Some((&key, &id)) = self.ready[lane].first_key_value() {
                let action = self.judge_head(id, now, gate);

                match action {
                    HeadAction::Drop => {
                        self.ready[lane].remove(&key);
                    }
                    HeadAction::Expired(snapshot) => {
                        self.ready[lane].remove(&key);
                        outcome.expired.push(snapshot);
                    }
                    HeadAction::Claimed(snapshot) => {
                        self.ready[lane].remove(&key);
                        outcome.claimed = Some(snapshot);
                        return outcome;
                    }
                    HeadAction::Park { entry, stamp } => {
                        self.ready[lane].remove(&key);
                        merge_wake(&mut outcome.next_wake_at, stamp.resume_at);
                        outcome.rate_limited.push(stamp);
                        self.delayed.push(Reverse(entry));
                    }
                    HeadAction::StopGlobal { resume_at } => {
                        outcome.globally_limited = true;
                        merge_wake(&mut outcome.next_wake_at, resume_at);
                        break 'lanes;
                    }
                }
            }
        }

        if let Some(Reverse(top)) = self.delayed.peek() {
            merge_wake(&mut outcome.next_wake_at, top.scheduled_at);
        }

        outcome
    }

    fn judge_head<G>(&mut self, id: MessageId, now: DateTime<Utc>, gate: &mut G) -> HeadAction
    where
        G: FnMut(MessageId, &TenantId) -> AdmitDecision,
    {
        let Some(record) = self.records.get_mut(&id) else {
            return HeadAction::Drop;
        };
        if !record.status.is_claimable() {
            return HeadAction::Drop;
        }

        if record.has_expired(now) {
            record.status = MessageStatus::Expired;
            record.completed_at = Some(now);
            record.epoch += 1;
            return HeadAction::Expired(record.clone());
        }

        match gate(id, &record.tenant_id) {
            AdmitDecision::Granted => {
                record.status = MessageStatus::Sending;
                record.epoch += 1;
                HeadAction::Claimed(record.clone())
            }
            AdmitDecision::TenantLimited { wait } => {
                // The tenant is throttled; skip its messages so other
                // tenants behind them keep flowing.
                let resume_at = (now + from_std(wait)).max(record.scheduled_at);
                record.status = MessageStatus::RateLimited;
                record.scheduled_at = resume_at;
                record.epoch += 1;

                HeadAction::Park {
                    entry: DelayedEntry {
                        scheduled_at: resume_at,
                        seq: record.seq,
                        epoch: record.epoch,
                        id,
                    },
                    stamp: RateLimitStamp {
                        id,
                        tenant_id: record.tenant_id.clone(),
                        resume_at,
                    },
                }
            }
            AdmitDecision::GloballyLimited { wait } => {
                // Nothing can send until the shared bucket refills; the
                // message keeps its place at the head of its lane.
                HeadAction::StopGlobal {
                    resume_at: now + from_std(wait),
                }
            }
        }
    }
}

fn from_std(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

fn merge_wake(slot: &mut Option<DateTime<Utc>>, candidate: DateTime<Utc>) {
    *slot = Some(slot.map_or(candidate, |current| current.min(candidate)));
}

/// Concurrent priority queue for outbound messages
#[derive(Debug)]
pub struct MessageQueue {
    inner: parking_lot::Mutex<QueueInner>,
    notify: Notify,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueue {
    /// Create a new empty queue
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(QueueInner::new()),
            notify: Notify::new(),
        }
    }

    /// Wait until new work may be available
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Add a message to the queue
    ///
    /// The message becomes eligible immediately and dispatches after
    /// anything of higher priority and anything older at the same priority.
    pub fn enqueue(&self, mut message: QueuedMessage) -> MessageId {
        let id = message.id;

        {
            let mut inner = self.inner.lock();
            message.seq = inner.next_seq;
            inner.next_seq += 1;
            let key = (message.created_at, message.seq);
            inner.ready[message.priority.rank()].insert(key, id);
            inner.records.insert(id, message);
        }

        self.notify.notify_one();
        id
    }

    /// Claim the next dispatchable message, marking it `Sending`
    ///
    /// `gate` is consulted once per candidate and decides admission; it runs
    /// under the queue lock and must not block. Messages whose tenant is
    /// throttled are parked and the scan continues; an account-level limit
    /// stops the scan entirely.
    pub fn claim_next<G>(&self, now: DateTime<Utc>, mut gate: G) -> ClaimOutcome
    where
        G: FnMut(MessageId, &TenantId) -> AdmitDecision,
    {
        self.inner.lock().claim_next(now, &mut gate)
    }

    /// Record a successful send for a `Sending` message
    ///
    /// Returns the terminal snapshot, or `None` if the message was not in
    /// the `Sending` state.
    pub fn mark_sent(
        &self,
        id: MessageId,
        transport_message_id: &str,
        latency: Duration,
        now: DateTime<Utc>,
    ) -> Option<QueuedMessage> {
        let mut inner = self.inner.lock();

        let snapshot = {
            let record = claimed_record(&mut inner.records, id, "mark_sent")?;
            record.status = MessageStatus::Sent;
            record.completed_at = Some(now);
            record.transport_message_id = Some(transport_message_id.to_string());
            record.record_attempt(DispatchAttempt {
                at: now,
                outcome: AttemptOutcome::Delivered,
                latency_ms: Some(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX)),
                error: None,
            });
            record.clone()
        };

        let queue_ms = (now - snapshot.created_at).num_milliseconds();
        inner.stats.record_sent(&snapshot.tenant_id, now, queue_ms);

        Some(snapshot)
    }

    /// Schedule another attempt for a `Sending` message that failed
    ///
    /// Consumes one retry. The message returns to `Queued` (or
    /// `RateLimited` when the provider throttled the attempt) and becomes
    /// eligible at `next_at`, never earlier than its current schedule.
    ///
    /// Returns the new retry count and eligibility time.
    pub fn reschedule_retry(
        &self,
        id: MessageId,
        kind: ErrorKind,
        error: &str,
        latency: Option<Duration>,
        next_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<(u32, DateTime<Utc>)> {
        let result = {
            let mut inner = self.inner.lock();
            let inner = &mut *inner;

            let (tenant_id, retry_count, resume_at) = {
                let record = claimed_record(&mut inner.records, id, "reschedule_retry")?;
                record.retry_count += 1;
                record.status = if kind == ErrorKind::RateLimit {
                    MessageStatus::RateLimited
                } else {
                    MessageStatus::Queued
                };
                record.scheduled_at = next_at.max(record.scheduled_at);
                record.epoch += 1;
                record.last_error = Some(error.to_string());
                record.record_attempt(DispatchAttempt {
                    at: now,
                    outcome: AttemptOutcome::Failed(kind),
                    latency_ms: latency.map(|l| u64::try_from(l.as_millis()).unwrap_or(u64::MAX)),
                    error: Some(error.to_string()),
                });

                inner.delayed.push(Reverse(DelayedEntry {
                    scheduled_at: record.scheduled_at,
                    seq: record.seq,
                    epoch: record.epoch,
                    id,
                }));

                (
                    record.tenant_id.clone(),
                    record.retry_count,
                    record.scheduled_at,
                )
            };

            inner.stats.record_failure(&tenant_id, now, error);
            (retry_count, resume_at)
        };

        self.notify.notify_one();
        Some(result)
    }

    /// Return a `Sending` message to the queue without costing a retry
    ///
    /// Used when the circuit breaker rejected the send before any provider
    /// call was made; the rejection says nothing about this message.
    pub fn requeue_circuit_open(&self, id: MessageId, now: DateTime<Utc>) -> bool {
        let requeued = {
            let mut inner = self.inner.lock();

            let key = {
                let Some(record) = claimed_record(&mut inner.records, id, "requeue_circuit_open")
                else {
                    return false;
                };
                record.status = MessageStatus::Queued;
                record.last_attempt_at = Some(now);
                (
                    record.priority.rank(),
                    (record.created_at, record.seq),
                    record.id,
                )
            };

            inner.ready[key.0].insert(key.1, key.2);
            true
        };

        self.notify.notify_one();
        requeued
    }

    /// Terminally fail a `Sending` message
    pub fn mark_failed(
        &self,
        id: MessageId,
        kind: ErrorKind,
        error: &str,
        latency: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Option<QueuedMessage> {
        let mut inner = self.inner.lock();

        let snapshot = {
            let record = claimed_record(&mut inner.records, id, "mark_failed")?;
            record.status = MessageStatus::Failed;
            record.completed_at = Some(now);
            record.last_error = Some(error.to_string());
            record.record_attempt(DispatchAttempt {
                at: now,
                outcome: AttemptOutcome::Failed(kind),
                latency_ms: latency.map(|l| u64::try_from(l.as_millis()).unwrap_or(u64::MAX)),
                error: Some(error.to_string()),
            });
            record.clone()
        };

        inner
            .stats
            .record_failure(&snapshot.tenant_id, now, error);

        Some(snapshot)
    }

    /// Cancel a message that has not been claimed for sending
    ///
    /// Returns `true` only when the message was still claimable; messages
    /// already `Sending` or terminal are left untouched.
    pub fn cancel(&self, id: MessageId, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock();

        let key = {
            let Some(record) = inner.records.get_mut(&id) else {
                return false;
            };
            if !record.status.is_claimable() {
                return false;
            }

            record.status = MessageStatus::Cancelled;
            record.completed_at = Some(now);
            record.epoch += 1;
            (record.priority.rank(), (record.created_at, record.seq))
        };

        inner.ready[key.0].remove(&key.1);
        true
    }

    /// Expire every waiting message whose deadline has passed
    ///
    /// Messages currently `Sending` are left alone; their in-flight attempt
    /// finishes normally.
    pub fn expire_due(&self, now: DateTime<Utc>) -> Vec<QueuedMessage> {
        let mut inner = self.inner.lock();

        let due: Vec<MessageId> = inner
            .records
            .values()
            .filter(|record| record.status.is_claimable() && record.has_expired(now))
            .map(|record| record.id)
            .collect();

        let mut expired = Vec::with_capacity(due.len());
        for id in due {
            let key = {
                let Some(record) = inner.records.get_mut(&id) else {
                    continue;
                };
                record.status = MessageStatus::Expired;
                record.completed_at = Some(now);
                record.epoch += 1;
                expired.push(record.clone());
                (record.priority.rank(), (record.created_at, record.seq))
            };
            inner.ready[key.0].remove(&key.1);
        }

        expired
    }

    /// Drop terminal records older than the retention window
    ///
    /// Also prunes aged-out statistics history. Returns how many records
    /// were removed.
    pub fn purge_terminal(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let mut inner = self.inner.lock();
        let cutoff = now - from_std(retention);

        let before = inner.records.len();
        inner.records.retain(|_, record| {
            !(record.status.is_terminal()
                && record.completed_at.is_some_and(|completed| completed <= cutoff))
        });
        inner.stats.prune(now);

        before.saturating_sub(inner.records.len())
    }

    /// Get a snapshot of one message
    pub fn get(&self, id: MessageId) -> Option<QueuedMessage> {
        self.inner.lock().records.get(&id).cloned()
    }

    /// Message counts per lifecycle status
    pub fn status_counts(&self) -> StatusCounts {
        let inner = self.inner.lock();
        let mut counts = StatusCounts::default();

        for record in inner.records.values() {
            match record.status {
                MessageStatus::Queued => counts.queued += 1,
                MessageStatus::RateLimited => counts.rate_limited += 1,
                MessageStatus::Sending => counts.sending += 1,
                MessageStatus::Sent => counts.sent += 1,
                MessageStatus::Failed => counts.failed += 1,
                MessageStatus::Expired => counts.expired += 1,
                MessageStatus::Cancelled => counts.cancelled += 1,
            }
        }

        counts
    }

    /// Load, throughput, and health for the whole queue or one tenant
    pub fn statistics(
        &self,
        tenant: Option<&TenantId>,
        thresholds: &HealthThresholds,
        now: DateTime<Utc>,
    ) -> QueueStatistics {
        let mut inner = self.inner.lock();

        let mut by_status = StatusCounts::default();
        let mut by_priority = PriorityCounts::default();

        for record in inner.records.values() {
            if tenant.is_some_and(|t| *t != record.tenant_id) {
                continue;
            }

            match record.status {
                MessageStatus::Queued => by_status.queued += 1,
                MessageStatus::RateLimited => by_status.rate_limited += 1,
                MessageStatus::Sending => by_status.sending += 1,
                MessageStatus::Sent => by_status.sent += 1,
                MessageStatus::Failed => by_status.failed += 1,
                MessageStatus::Expired => by_status.expired += 1,
                MessageStatus::Cancelled => by_status.cancelled += 1,
            }

            if !record.status.is_terminal() {
                match record.priority {
                    Priority::Urgent => by_priority.urgent += 1,
                    Priority::High => by_priority.high += 1,
                    Priority::Normal => by_priority.normal += 1,
                    Priority::Low => by_priority.low += 1,
                }
            }
        }

        let window = inner.stats.snapshot(tenant, now);
        let depth = by_status.active();

        QueueStatistics {
            depth,
            by_status,
            by_priority,
            sent_last_minute: window.sent_last_minute,
            sent_last_hour: window.sent_last_hour,
            throughput_per_sec: window.throughput_per_sec,
            avg_queue_time_ms: window.avg_queue_time_ms,
            failure_rate: window.failure_rate,
            health: Health::evaluate(depth, window.failure_rate, thresholds),
        }
    }

    /// Rolling outcome history for service-level reporting
    pub(crate) fn window_snapshot(
        &self,
        tenant: Option<&TenantId>,
        now: DateTime<Utc>,
    ) -> crate::stats::WindowSnapshot {
        self.inner.lock().stats.snapshot(tenant, now)
    }

    /// Number of retained records, terminal included
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Whether no records are retained
    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }
}

/// Look up a record expected to be `Sending`, warning when it is not
fn claimed_record<'r>(
    records: &'r mut AHashMap<MessageId, QueuedMessage>,
    id: MessageId,
    operation: &str,
) -> Option<&'r mut QueuedMessage> {
    let record = records.get_mut(&id);

    match record {
        Some(record) if record.status == MessageStatus::Sending => Some(record),
        Some(record) => {
            tracing::warn!(
                message_id = %id,
                status = record.status.as_str(),
                operation,
                "Transition ignored: message is not in the sending state"
            );
            None
        }
        None => {
            tracing::warn!(
                message_id = %id,
                operation,
                "Transition ignored: message is unknown"
            );
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use crate::message::MessagePayload;

    use super::*;

    fn message(tenant: &str, priority: Priority) -> QueuedMessage {
        QueuedMessage::new(
            TenantId::new(tenant),
            "+15550100",
            MessagePayload::Text {
                body: "Your technician is on the way".to_string(),
            },
            priority,
            3,
            None,
        )
    }

    fn granted(_: MessageId, _: &TenantId) -> AdmitDecision {
        AdmitDecision::Granted
    }

    #[test]
    fn test_priority_order_then_fifo() {
        let queue = MessageQueue::new();

        let a = queue.enqueue(message("org_a", Priority::Low));
        let b = queue.enqueue(message("org_b", Priority::Urgent));
        let c = queue.enqueue(message("org_c", Priority::Normal));
        let d = queue.enqueue(message("org_d", Priority::Normal));

        let now = Utc::now();
        let order: Vec<MessageId> = (0..4)
            .map(|_| queue.claim_next(now, granted).claimed.unwrap().id)
            .collect();

        assert_eq!(order, vec![b, c, d, a]);
        assert!(queue.claim_next(now, granted).claimed.is_none());
    }

    #[test]
    fn test_fifo_breaks_ties_by_arrival_sequence() {
        let queue = MessageQueue::new();
        let now = Utc::now();

        let mut first = message("org_a", Priority::Normal);
        let mut second = message("org_a", Priority::Normal);
        // Force identical creation timestamps
        first.created_at = now;
        first.scheduled_at = now;
        second.created_at = now;
        second.scheduled_at = now;

        let first_id = queue.enqueue(first);
        let second_id = queue.enqueue(second);

        assert_eq!(queue.claim_next(now, granted).claimed.unwrap().id, first_id);
        assert_eq!(queue.claim_next(now, granted).claimed.unwrap().id, second_id);
    }

    #[test]
    fn test_claim_is_at_most_once() {
        let queue = MessageQueue::new();
        let id = queue.enqueue(message("org_a", Priority::Normal));
        let now = Utc::now();

        let claimed = queue.claim_next(now, granted).claimed.unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, MessageStatus::Sending);

        // The same message can never be claimed twice
        assert!(queue.claim_next(now, granted).claimed.is_none());
    }

    #[test]
    fn test_throttled_tenant_is_skipped_not_blocking() {
        let queue = MessageQueue::new();
        let now = Utc::now();

        queue.enqueue(message("org_noisy", Priority::Normal));
        queue.enqueue(message("org_noisy", Priority::Normal));
        let quiet = queue.enqueue(message("org_quiet", Priority::Normal));

        let outcome = queue.claim_next(now, |_, tenant| {
            if tenant.as_str() == "org_noisy" {
                AdmitDecision::TenantLimited {
                    wait: Duration::from_millis(500),
                }
            } else {
                AdmitDecision::Granted
            }
        });

        // The quiet tenant's message dispatches despite sitting behind two
        // throttled ones
        assert_eq!(outcome.claimed.unwrap().id, quiet);
        assert_eq!(outcome.rate_limited.len(), 2);

        for stamp in &outcome.rate_limited {
            let record = queue.get(stamp.id).unwrap();
            assert_eq!(record.status, MessageStatus::RateLimited);
            assert!(record.scheduled_at > now);
            // Limiter waits are free, no retry consumed
            assert_eq!(record.retry_count, 0);
        }
    }

    #[test]
    fn test_global_limit_stops_the_scan() {
        let queue = MessageQueue::new();
        let now = Utc::now();

        let id = queue.enqueue(message("org_a", Priority::Normal));
        queue.enqueue(message("org_b", Priority::Normal));

        let outcome = queue.claim_next(now, |_, _| AdmitDecision::GloballyLimited {
            wait: Duration::from_millis(250),
        });

        assert!(outcome.claimed.is_none());
        assert!(outcome.globally_limited);
        assert!(outcome.rate_limited.is_empty());

        let wake = outcome.next_wake_at.unwrap();
        assert!(wake > now);

        // Head of line keeps its place and its status
        assert_eq!(queue.get(id).unwrap().status, MessageStatus::Queued);
    }

    #[test]
    fn test_expired_message_skipped_before_admission() {
        let queue = MessageQueue::new();
        let now = Utc::now();

        let mut stale = message("org_a", Priority::Normal);
        stale.expires_at = Some(now - chrono::Duration::seconds(5));
        let stale_id = queue.enqueue(stale);
        let fresh_id = queue.enqueue(message("org_a", Priority::Normal));

        let mut gate_calls = 0;
        let outcome = queue.claim_next(now, |_, _| {
            gate_calls += 1;
            AdmitDecision::Granted
        });

        assert_eq!(outcome.claimed.unwrap().id, fresh_id);
        assert_eq!(outcome.expired.len(), 1);
        assert_eq!(outcome.expired[0].id, stale_id);
        // No admission token was spent on the expired message
        assert_eq!(gate_calls, 1);
        assert_eq!(queue.get(stale_id).unwrap().status, MessageStatus::Expired);
    }

    #[test]
    fn test_retry_reschedule_and_promotion() {
        let queue = MessageQueue::new();
        let now = Utc::now();
        let id = queue.enqueue(message("org_a", Priority::Normal));

        queue.claim_next(now, granted);

        let next_at = now + chrono::Duration::seconds(1);
        let (retry_count, resume_at) = queue
            .reschedule_retry(
                id,
                ErrorKind::Transient,
                "connection reset",
                Some(Duration::from_millis(80)),
                next_at,
                now,
            )
            .unwrap();

        assert_eq!(retry_count, 1);
        assert_eq!(resume_at, next_at);

        let record = queue.get(id).unwrap();
        assert_eq!(record.status, MessageStatus::Queued);
        assert_eq!(record.attempts.len(), 1);

        // Not yet due
        assert!(queue.claim_next(now, granted).claimed.is_none());

        // Due after the backoff passes
        let later = now + chrono::Duration::seconds(2);
        let claimed = queue.claim_next(later, granted).claimed.unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.retry_count, 1);
    }

    #[test]
    fn test_provider_throttle_retry_parks_as_rate_limited() {
        let queue = MessageQueue::new();
        let now = Utc::now();
        let id = queue.enqueue(message("org_a", Priority::Normal));

        queue.claim_next(now, granted);
        queue
            .reschedule_retry(
                id,
                ErrorKind::RateLimit,
                "Too many requests",
                None,
                now + chrono::Duration::seconds(1),
                now,
            )
            .unwrap();

        assert_eq!(queue.get(id).unwrap().status, MessageStatus::RateLimited);

        // Promotion flips it back to queued and it dispatches
        let later = now + chrono::Duration::seconds(2);
        assert_eq!(queue.claim_next(later, granted).claimed.unwrap().id, id);
    }

    #[test]
    fn test_reschedule_never_rewinds_eligibility() {
        let queue = MessageQueue::new();
        let now = Utc::now();
        let id = queue.enqueue(message("org_a", Priority::Normal));

        queue.claim_next(now, granted);

        let far = now + chrono::Duration::seconds(30);
        queue
            .reschedule_retry(id, ErrorKind::Transient, "err", None, far, now)
            .unwrap();

        // A second claim cycle at t+31 with an earlier next_at must not
        // pull the schedule backwards
        let later = now + chrono::Duration::seconds(31);
        let claimed = queue.claim_next(later, granted).claimed;
        assert_eq!(claimed.unwrap().id, id);

        let earlier = now + chrono::Duration::seconds(5);
        let (_, resume_at) = queue
            .reschedule_retry(id, ErrorKind::Transient, "err", None, earlier, later)
            .unwrap();
        assert!(resume_at >= far);
    }

    #[test]
    fn test_circuit_requeue_costs_no_retry() {
        let queue = MessageQueue::new();
        let now = Utc::now();
        let id = queue.enqueue(message("org_a", Priority::Normal));

        queue.claim_next(now, granted);
        assert!(queue.requeue_circuit_open(id, now));

        let record = queue.get(id).unwrap();
        assert_eq!(record.status, MessageStatus::Queued);
        assert_eq!(record.retry_count, 0);
        assert!(record.attempts.is_empty());

        // Immediately claimable again
        assert_eq!(queue.claim_next(now, granted).claimed.unwrap().id, id);
    }

    #[test]
    fn test_cancel_only_while_claimable() {
        let queue = MessageQueue::new();
        let now = Utc::now();

        let waiting = queue.enqueue(message("org_a", Priority::Normal));
        assert!(queue.cancel(waiting, now));
        assert_eq!(queue.get(waiting).unwrap().status, MessageStatus::Cancelled);

        // Cancelled messages are never dispatched
        assert!(queue.claim_next(now, granted).claimed.is_none());

        // A message being sent cannot be cancelled
        let inflight = queue.enqueue(message("org_a", Priority::Normal));
        queue.claim_next(now, granted);
        assert!(!queue.cancel(inflight, now));

        // Terminal states are immutable
        assert!(!queue.cancel(waiting, now));
    }

    #[test]
    fn test_terminal_states_ignore_further_transitions() {
        let queue = MessageQueue::new();
        let now = Utc::now();
        let id = queue.enqueue(message("org_a", Priority::Normal));

        queue.claim_next(now, granted);
        let sent = queue
            .mark_sent(id, "wamid.123", Duration::from_millis(90), now)
            .unwrap();
        assert_eq!(sent.status, MessageStatus::Sent);
        assert_eq!(sent.transport_message_id.as_deref(), Some("wamid.123"));

        // Every further transition is a no-op
        assert!(queue
            .reschedule_retry(id, ErrorKind::Transient, "late", None, now, now)
            .is_none());
        assert!(queue.mark_failed(id, ErrorKind::Permanent, "late", None, now).is_none());
        assert!(!queue.cancel(id, now));
        assert!(!queue.requeue_circuit_open(id, now));
        assert_eq!(queue.get(id).unwrap().status, MessageStatus::Sent);
    }

    #[test]
    fn test_stale_delay_entries_cannot_resurrect() {
        let queue = MessageQueue::new();
        let now = Utc::now();
        let id = queue.enqueue(message("org_a", Priority::Normal));

        queue.claim_next(now, granted);
        queue
            .reschedule_retry(
                id,
                ErrorKind::Transient,
                "err",
                None,
                now + chrono::Duration::seconds(1),
                now,
            )
            .unwrap();

        // Cancel while the delay entry is still in the heap
        assert!(queue.cancel(id, now));

        let later = now + chrono::Duration::seconds(5);
        assert!(queue.claim_next(later, granted).claimed.is_none());
        assert_eq!(queue.get(id).unwrap().status, MessageStatus::Cancelled);
    }

    #[test]
    fn test_expire_due_sweep() {
        let queue = MessageQueue::new();
        let now = Utc::now();

        let mut doomed = message("org_a", Priority::Normal);
        doomed.expires_at = Some(now + chrono::Duration::seconds(10));
        let doomed_id = queue.enqueue(doomed);
        let healthy_id = queue.enqueue(message("org_a", Priority::Normal));

        assert!(queue.expire_due(now).is_empty());

        let later = now + chrono::Duration::seconds(11);
        let expired = queue.expire_due(later);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, doomed_id);
        assert_eq!(queue.get(doomed_id).unwrap().status, MessageStatus::Expired);
        assert_eq!(queue.get(healthy_id).unwrap().status, MessageStatus::Queued);
    }

    #[test]
    fn test_purge_respects_retention() {
        let queue = MessageQueue::new();
        let now = Utc::now();
        let id = queue.enqueue(message("org_a", Priority::Normal));

        queue.claim_next(now, granted);
        queue.mark_sent(id, "wamid.1", Duration::from_millis(50), now);

        // Inside the retention window: kept
        assert_eq!(queue.purge_terminal(now, Duration::from_secs(3600)), 0);
        assert!(queue.get(id).is_some());

        // Outside: dropped
        let later = now + chrono::Duration::hours(2);
        assert_eq!(queue.purge_terminal(later, Duration::from_secs(3600)), 1);
        assert!(queue.get(id).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_statistics_snapshot() {
        let queue = MessageQueue::new();
        let now = Utc::now();

        let sent_id = queue.enqueue(message("org_a", Priority::Urgent));
        queue.enqueue(message("org_a", Priority::Normal));
        queue.enqueue(message("org_b", Priority::Low));

        queue.claim_next(now, granted);
        queue.mark_sent(sent_id, "wamid.1", Duration::from_millis(120), now);

        let stats = queue.statistics(None, &HealthThresholds::default(), now);
        assert_eq!(stats.depth, 2);
        assert_eq!(stats.by_status.sent, 1);
        assert_eq!(stats.by_status.queued, 2);
        assert_eq!(stats.by_priority.normal, 1);
        assert_eq!(stats.by_priority.low, 1);
        assert_eq!(stats.by_priority.urgent, 0);
        assert_eq!(stats.sent_last_minute, 1);
        assert!(stats.avg_queue_time_ms.is_some());
        assert_eq!(stats.health, Health::Healthy);

        // Tenant filter narrows every number
        let org_b = TenantId::new("org_b");
        let scoped = queue.statistics(Some(&org_b), &HealthThresholds::default(), now);
        assert_eq!(scoped.depth, 1);
        assert_eq!(scoped.by_status.sent, 0);
        assert_eq!(scoped.sent_last_minute, 0);
    }
}
