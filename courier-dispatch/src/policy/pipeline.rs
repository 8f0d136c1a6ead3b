//! Dispatch pipeline orchestration
//!
//! Coordinates the admission stages wrapped around every send attempt:
//!
//! 1. **Rate Limiting**: two-level token bucket admission per candidate
//! 2. **Circuit Breaker**: provider health gate around the transport call
//!
//! Both collaborators are optional so the pipeline degrades to a plain
//! pass-through in tests and in deployments that disable a stage.

use chrono::{DateTime, Utc};
use courier_common::TenantId;
use tracing::info;

use crate::{
    circuit_breaker::{CircuitBreaker, CircuitState},
    error::{DispatchError, TransportError},
    message::MessageId,
    rate_limiter::{AdmitDecision, RateLimiter},
};

/// Admission and protection checks around one send attempt
///
/// Borrows its collaborators; the dispatcher constructs one per pump pass.
#[derive(Debug, Clone, Copy)]
pub struct DispatchPipeline<'a> {
    rate_limiter: Option<&'a RateLimiter>,
    circuit_breaker: Option<&'a CircuitBreaker>,
}

impl<'a> DispatchPipeline<'a> {
    /// Create a new dispatch pipeline
    #[must_use]
    pub const fn new(
        rate_limiter: Option<&'a RateLimiter>,
        circuit_breaker: Option<&'a CircuitBreaker>,
    ) -> Self {
        Self {
            rate_limiter,
            circuit_breaker,
        }
    }

    /// Stage 1: Rate limit admission for one candidate message
    ///
    /// Consumes a token from both bucket levels when granted. Without a
    /// configured limiter every candidate is admitted. Runs under the queue
    /// lock during a claim scan, so it must stay non-blocking.
    pub fn admit(&self, message_id: MessageId, tenant: &TenantId) -> AdmitDecision {
        let Some(rate_limiter) = self.rate_limiter else {
            return AdmitDecision::Granted;
        };

        let decision = rate_limiter.check_and_consume(tenant);

        match decision {
            AdmitDecision::Granted => {}
            AdmitDecision::TenantLimited { wait } => {
                if let Some(metrics) = courier_metrics::try_metrics() {
                    metrics.dispatch.record_rate_limited(
                        tenant.as_str(),
                        "tenant",
                        wait.as_secs_f64(),
                    );
                }

                info!(
                    message_id = %message_id,
                    tenant = %tenant,
                    wait_seconds = wait.as_secs_f64(),
                    "Tenant rate limit reached, message delayed"
                );
            }
            AdmitDecision::GloballyLimited { wait } => {
                if let Some(metrics) = courier_metrics::try_metrics() {
                    metrics.dispatch.record_rate_limited(
                        tenant.as_str(),
                        "global",
                        wait.as_secs_f64(),
                    );
                }

                info!(
                    message_id = %message_id,
                    wait_seconds = wait.as_secs_f64(),
                    "Account rate limit reached, dispatch paused"
                );
            }
        }

        decision
    }

    /// Current circuit state, `Closed` when no breaker is configured
    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker
            .map_or(CircuitState::Closed, CircuitBreaker::state)
    }

    /// How many new sends the circuit allows right now
    ///
    /// `None` means unbounded (closed circuit or no breaker); `Some(0)`
    /// means dispatch is suspended.
    pub fn dispatch_allowance(&self) -> Option<u32> {
        self.circuit_breaker
            .and_then(CircuitBreaker::available_probes)
    }

    /// Earliest time the circuit could admit a send again, if it is open
    pub fn next_circuit_retry(&self) -> Option<DateTime<Utc>> {
        self.circuit_breaker
            .and_then(CircuitBreaker::next_retry_at)
    }

    /// Stage 2: Run the transport call under the circuit breaker
    ///
    /// With a breaker present this delegates to its guarded execution,
    /// recording the outcome; without one the operation runs bare and
    /// transport errors pass through.
    ///
    /// # Errors
    ///
    /// [`DispatchError::CircuitOpen`] when the breaker rejects the send,
    /// or the operation's own error.
    pub async fn send_guarded<T, F, Fut>(&self, op: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        match self.circuit_breaker {
            Some(breaker) => breaker.execute(op).await,
            None => op().await.map_err(DispatchError::from),
        }
    }
}
