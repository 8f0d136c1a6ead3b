//! Outbound message dispatch for the provider messaging API
//!
//! This crate provides functionality to:
//! - Queue outbound messages by priority with per-message retry budgets
//! - Rate limit sends per tenant and across the provider account
//! - Trip a circuit breaker when the provider degrades
//! - Classify provider errors into retry decisions
//! - Broadcast lifecycle events for webhooks and dashboards

mod circuit_breaker;
mod classify;
mod dispatcher;
mod error;
mod events;
mod message;
mod policy;
pub mod queue;
mod rate_limiter;
mod service;
mod stats;
mod transport;

// Re-export circuit breaker types
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
};
// Re-export error classification
pub use classify::{ErrorKind, classify};
// Re-export core types
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, TransportError};
pub use events::{DispatchEvent, EventBus};
pub use message::{
    AttemptOutcome, Button, DispatchAttempt, InteractiveKind, ListRow, ListSection,
    MAX_INTERACTIVE_BUTTONS, MediaKind, MessageId, MessagePayload, MessageStatus, PayloadError,
    Priority, QueuedMessage,
};
pub use policy::DispatchPipeline;
pub use queue::{ClaimOutcome, MessageQueue, RateLimitStamp, retry::RetryPolicy};
// Re-export rate limiting types
pub use rate_limiter::{
    AdmitDecision, RateLimitConfig, RateLimitStats, RateLimiter, TenantRateLimit,
};
pub use service::{CourierService, EnqueueOptions, RateLimiterStatus, ServiceStatus};
pub use stats::{Health, HealthThresholds, PriorityCounts, QueueStatistics, StatusCounts};
pub use transport::{Transport, TransportReceipt};
