//! Lifecycle event broadcasting
//!
//! Every consequential transition in a message's life is published here so
//! callers can drive webhooks, UI updates, or audit trails without polling.
//! Delivery is best-effort over a broadcast channel; a slow subscriber lags
//! and skips, it never backpressures dispatch.

use chrono::{DateTime, Utc};
use courier_common::TenantId;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::message::{MessageId, Priority};

/// Broadcast buffer size per subscriber
const EVENT_CAPACITY: usize = 256;

/// A message lifecycle or circuit transition notification
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatchEvent {
    /// A message was accepted into the queue
    Enqueued {
        id: MessageId,
        tenant_id: TenantId,
        priority: Priority,
    },
    /// A message was delivered to the provider
    Sent {
        id: MessageId,
        tenant_id: TenantId,
        transport_message_id: String,
        latency_ms: u64,
    },
    /// An attempt failed and another is scheduled
    Retrying {
        id: MessageId,
        tenant_id: TenantId,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        error: String,
    },
    /// A message was parked by the rate limiter
    RateLimited {
        id: MessageId,
        tenant_id: TenantId,
        resume_at: DateTime<Utc>,
    },
    /// A message failed terminally
    Failed {
        id: MessageId,
        tenant_id: TenantId,
        error: String,
    },
    /// A message's delivery deadline passed before it could be sent
    Expired { id: MessageId, tenant_id: TenantId },
    /// A message was cancelled by the caller
    Cancelled { id: MessageId, tenant_id: TenantId },
    /// The circuit breaker tripped; sends are suspended
    CircuitOpened { next_retry_at: DateTime<Utc> },
    /// The circuit breaker is probing the provider for recovery
    CircuitHalfOpen,
    /// The circuit breaker closed; normal dispatch resumed
    CircuitClosed,
}

/// Fan-out channel for [`DispatchEvent`]s
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<DispatchEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Subscribe to all events from this point forward
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to every current subscriber
    ///
    /// Send errors only mean nobody is listening, which is fine.
    pub(crate) fn emit(&self, event: DispatchEvent) {
        let _ = self.sender.send(event);
    }
}
