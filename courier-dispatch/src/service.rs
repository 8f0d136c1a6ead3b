//! Service facade and composition root
//!
//! [`CourierService`] owns the dispatcher and everything it wires together.
//! Producers share one clone per request-handling context; enqueueing is
//! non-blocking and never waits on the transport or on rate limit
//! availability.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use courier_common::{Signal, TenantId};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::{
    circuit_breaker::{CircuitBreaker, CircuitState},
    dispatcher::Dispatcher,
    error::DispatchError,
    events::DispatchEvent,
    message::{
        Button, InteractiveKind, ListSection, MediaKind, MessageId, MessagePayload, Priority,
        QueuedMessage,
    },
    rate_limiter::RateLimiter,
    stats::QueueStatistics,
    transport::Transport,
};

/// Caller-supplied options for a single enqueue
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Dispatch priority class
    pub priority: Priority,
    /// Overrides the configured default retry budget
    pub max_retries: Option<u32>,
    /// Hard deadline after which the message is abandoned
    pub expires_at: Option<DateTime<Utc>>,
}

impl EnqueueOptions {
    /// Options with the given priority and everything else defaulted
    #[must_use]
    pub fn with_priority(priority: Priority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }
}

/// Point-in-time view of overall dispatch health
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    /// Whether sends are currently being attempted
    pub available: bool,
    /// Current circuit breaker state
    pub circuit_state: CircuitState,
    /// Shared account bucket and backlog
    pub rate_limiter: RateLimiterStatus,
    /// When a send last succeeded
    pub last_success: Option<DateTime<Utc>>,
    /// Detail of the most recent failure
    pub last_error: Option<String>,
    /// Fraction of recently sampled sends that succeeded
    pub success_rate: Option<f64>,
    /// Mean latency across recently sampled sends
    pub avg_latency_ms: Option<f64>,
}

/// Rate limiter portion of [`ServiceStatus`]
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStatus {
    /// Tokens available in the shared account bucket right now
    pub current_rate: f64,
    /// Maximum burst capacity of the shared bucket
    pub capacity: f64,
    /// Messages waiting on a token or a backoff
    pub queued_messages: u64,
}

/// Facade over the outbound messaging pipeline
///
/// Cheap to clone; all clones share the same queue, limiter, breaker, and
/// event bus. Construct one per process, call [`serve`](Self::serve) once,
/// and hand clones to producers.
#[derive(Debug, Clone)]
pub struct CourierService {
    dispatcher: Arc<Dispatcher>,
}

impl CourierService {
    /// Build a service with default configuration
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(Dispatcher::default(), transport)
    }

    /// Build a service from deserialized configuration
    #[must_use]
    pub fn with_config(mut config: Dispatcher, transport: Arc<dyn Transport>) -> Self {
        config.init(transport);

        Self {
            dispatcher: Arc::new(config),
        }
    }

    /// Accept a message into the queue
    ///
    /// Returns immediately with the assigned ID; dispatch happens in the
    /// background. Failures after this point surface through the message's
    /// status, events, and statistics, never back to the producer.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidPayload`] if the payload fails
    /// validation. Nothing is enqueued in that case.
    pub fn enqueue(
        &self,
        tenant_id: TenantId,
        recipient: impl Into<String>,
        payload: MessagePayload,
        options: EnqueueOptions,
    ) -> Result<MessageId, DispatchError> {
        payload.validate()?;

        let max_retries = options
            .max_retries
            .unwrap_or(self.dispatcher.retry.max_retries);
        let message = QueuedMessage::new(
            tenant_id,
            recipient,
            payload,
            options.priority,
            max_retries,
            options.expires_at,
        );

        let tenant = message.tenant_id.clone();
        let priority = message.priority;
        let kind = message.payload.kind_str();
        let id = self.dispatcher.queue.enqueue(message);

        tracing::debug!(
            message_id = %id,
            tenant_id = %tenant,
            priority = priority.as_str(),
            payload = kind,
            "Message enqueued"
        );

        self.dispatcher.events.emit(DispatchEvent::Enqueued {
            id,
            tenant_id: tenant.clone(),
            priority,
        });

        if let Some(metrics) = courier_metrics::try_metrics() {
            metrics
                .dispatch
                .record_enqueued(tenant.as_str(), priority.as_str());
        }

        Ok(id)
    }

    /// Enqueue a free-form text message
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidPayload`] if the body is empty.
    pub fn enqueue_text(
        &self,
        tenant_id: TenantId,
        recipient: impl Into<String>,
        body: impl Into<String>,
        options: EnqueueOptions,
    ) -> Result<MessageId, DispatchError> {
        self.enqueue(
            tenant_id,
            recipient,
            MessagePayload::Text { body: body.into() },
            options,
        )
    }

    /// Enqueue a pre-approved template message
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidPayload`] if the template name or
    /// language is empty.
    pub fn enqueue_template(
        &self,
        tenant_id: TenantId,
        recipient: impl Into<String>,
        name: impl Into<String>,
        language: impl Into<String>,
        parameters: Vec<String>,
        options: EnqueueOptions,
    ) -> Result<MessageId, DispatchError> {
        self.enqueue(
            tenant_id,
            recipient,
            MessagePayload::Template {
                name: name.into(),
                language: language.into(),
                parameters,
            },
            options,
        )
    }

    /// Enqueue an interactive message with reply buttons or a list menu
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidPayload`] if the button count or
    /// section contents violate the provider's limits.
    pub fn enqueue_interactive(
        &self,
        tenant_id: TenantId,
        recipient: impl Into<String>,
        kind: InteractiveKind,
        body: impl Into<String>,
        buttons: Vec<Button>,
        sections: Vec<ListSection>,
        options: EnqueueOptions,
    ) -> Result<MessageId, DispatchError> {
        self.enqueue(
            tenant_id,
            recipient,
            MessagePayload::Interactive {
                kind,
                body: body.into(),
                buttons,
                sections,
            },
            options,
        )
    }

    /// Enqueue a media attachment by URL
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidPayload`] if the URL is empty.
    pub fn enqueue_media(
        &self,
        tenant_id: TenantId,
        recipient: impl Into<String>,
        kind: MediaKind,
        url: impl Into<String>,
        caption: Option<String>,
        options: EnqueueOptions,
    ) -> Result<MessageId, DispatchError> {
        self.enqueue(
            tenant_id,
            recipient,
            MessagePayload::Media {
                kind,
                url: url.into(),
                caption,
            },
            options,
        )
    }

    /// Cancel a message that has not been claimed for sending
    ///
    /// Best-effort and race-prone against an in-flight dispatch: returns
    /// `false` when the message is unknown, already `Sending`, or terminal.
    pub fn cancel(&self, id: MessageId) -> bool {
        if !self.dispatcher.queue.cancel(id, Utc::now()) {
            return false;
        }

        if let Some(message) = self.dispatcher.queue.get(id) {
            tracing::debug!(
                message_id = %id,
                tenant_id = %message.tenant_id,
                "Message cancelled"
            );
            self.dispatcher.events.emit(DispatchEvent::Cancelled {
                id,
                tenant_id: message.tenant_id.clone(),
            });
            if let Some(metrics) = courier_metrics::try_metrics() {
                metrics
                    .dispatch
                    .record_cancelled(message.tenant_id.as_str());
            }
        }

        true
    }

    /// Snapshot of a message, if it is still retained
    #[must_use]
    pub fn message(&self, id: MessageId) -> Option<QueuedMessage> {
        self.dispatcher.queue.get(id)
    }

    /// Queue statistics, optionally narrowed to one tenant
    #[must_use]
    pub fn statistics(&self, tenant: Option<&TenantId>) -> QueueStatistics {
        self.dispatcher
            .queue
            .statistics(tenant, &self.dispatcher.health, Utc::now())
    }

    /// Overall dispatch health for operator dashboards
    #[must_use]
    pub fn service_status(&self) -> ServiceStatus {
        let breaker_stats = self.dispatcher.breaker.as_ref().map(CircuitBreaker::stats);
        let circuit_state = breaker_stats
            .as_ref()
            .map_or(CircuitState::Closed, |stats| stats.state);

        let bucket = self
            .dispatcher
            .limiter
            .as_ref()
            .map(RateLimiter::global_stats);
        let counts = self.dispatcher.queue.status_counts();
        let window = self.dispatcher.queue.window_snapshot(None, Utc::now());

        ServiceStatus {
            available: circuit_state != CircuitState::Open,
            circuit_state,
            rate_limiter: RateLimiterStatus {
                current_rate: bucket.as_ref().map_or(0.0, |stats| stats.available_tokens),
                capacity: bucket.as_ref().map_or(0.0, |stats| stats.capacity),
                queued_messages: counts.queued + counts.rate_limited,
            },
            last_success: window.last_success_at,
            last_error: window.last_error,
            success_rate: breaker_stats.as_ref().and_then(|stats| stats.success_rate),
            avg_latency_ms: breaker_stats.and_then(|stats| stats.avg_latency_ms),
        }
    }

    /// Subscribe to lifecycle events from this point forward
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.dispatcher.events.subscribe()
    }

    /// Run the dispatch loop until shutdown
    ///
    /// # Errors
    ///
    /// Propagates [`DispatchError::NotInitialized`] if construction was
    /// bypassed.
    pub async fn serve(&self, shutdown: broadcast::Receiver<Signal>) -> Result<(), DispatchError> {
        Arc::clone(&self.dispatcher).serve(shutdown).await
    }

    /// The dispatcher this service wires together
    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}
