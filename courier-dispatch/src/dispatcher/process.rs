//! Claim and dispatch logic for in-flight sends

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;

use crate::{
    circuit_breaker::CircuitState,
    classify::{ErrorKind, classify},
    dispatcher::Dispatcher,
    error::{DispatchError, TransportError},
    events::DispatchEvent,
    message::QueuedMessage,
    policy::DispatchPipeline,
    transport::{Transport, TransportReceipt},
};

/// Claim eligible messages and spawn a dispatch task for each
///
/// Fills `workers` up to the concurrency limit, stopping early when the
/// circuit breaker has no probe slots or the account bucket is empty.
/// Returns the earliest time more work becomes eligible, for the dispatch
/// loop's timer.
pub(super) fn pump(
    dispatcher: &Arc<Dispatcher>,
    transport: &Arc<dyn Transport>,
    workers: &mut JoinSet<()>,
    last_circuit: &mut CircuitState,
) -> Option<DateTime<Utc>> {
    let pipeline = DispatchPipeline::new(dispatcher.limiter.as_ref(), dispatcher.breaker.as_ref());

    observe_circuit(dispatcher, &pipeline, last_circuit);

    let mut next_wake: Option<DateTime<Utc>> = None;
    let mut probe_budget = pipeline.dispatch_allowance();

    loop {
        if workers.len() >= dispatcher.max_concurrent_dispatches {
            break;
        }

        if let Some(budget) = probe_budget {
            if budget == 0 {
                merge_wake(&mut next_wake, pipeline.next_circuit_retry());
                break;
            }
        }

        let outcome = dispatcher
            .queue
            .claim_next(Utc::now(), |id, tenant| pipeline.admit(id, tenant));

        dispatcher.note_expired(&outcome.expired);
        for stamp in &outcome.rate_limited {
            dispatcher.events.emit(DispatchEvent::RateLimited {
                id: stamp.id,
                tenant_id: stamp.tenant_id.clone(),
                resume_at: stamp.resume_at,
            });
        }
        merge_wake(&mut next_wake, outcome.next_wake_at);

        let Some(message) = outcome.claimed else {
            break;
        };

        if let Some(budget) = &mut probe_budget {
            *budget -= 1;
        }

        let task_dispatcher = Arc::clone(dispatcher);
        let task_transport = Arc::clone(transport);
        workers.spawn(async move {
            dispatch_one(task_dispatcher, task_transport, message).await;
        });
    }

    next_wake
}

/// Dispatch a single claimed message (spawned as a task)
pub(super) async fn dispatch_one(
    dispatcher: Arc<Dispatcher>,
    transport: Arc<dyn Transport>,
    message: QueuedMessage,
) {
    let pipeline = DispatchPipeline::new(dispatcher.limiter.as_ref(), dispatcher.breaker.as_ref());
    let deadline = Duration::from_millis(dispatcher.transport_timeout_ms);

    if let Some(metrics) = courier_metrics::try_metrics() {
        metrics.dispatch.record_send_started();
    }

    let started = std::time::Instant::now();
    let result = pipeline
        .send_guarded(|| async {
            match tokio::time::timeout(deadline, transport.send(&message)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(deadline)),
            }
        })
        .await;
    let latency = started.elapsed();

    if let Some(metrics) = courier_metrics::try_metrics() {
        metrics.dispatch.record_send_finished();
    }

    let now = Utc::now();
    match result {
        Ok(receipt) => handle_send_success(&dispatcher, &message, &receipt, latency, now),
        Err(DispatchError::CircuitOpen { next_retry_at }) => {
            tracing::warn!(
                message_id = %message.id,
                next_retry_at = %next_retry_at,
                "Circuit breaker open, send rejected before reaching the provider; message requeued"
            );
            dispatcher.queue.requeue_circuit_open(message.id, now);
        }
        Err(DispatchError::Transport(error)) => {
            handle_send_failure(&dispatcher, &message, &error, latency, now);
        }
        Err(error) => {
            tracing::error!(
                message_id = %message.id,
                error = %error,
                "Unexpected dispatch failure"
            );
            fail_terminally(
                &dispatcher,
                &message,
                ErrorKind::Permanent,
                &error.to_string(),
                Some(latency),
                now,
            );
        }
    }
}

/// Publish a circuit state change observed since the last pump
///
/// Only the dispatch loop calls this, so each transition is announced
/// exactly once even with many workers recording outcomes concurrently.
fn observe_circuit(
    dispatcher: &Dispatcher,
    pipeline: &DispatchPipeline<'_>,
    last: &mut CircuitState,
) {
    let state = pipeline.circuit_state();
    if state == *last {
        return;
    }

    match state {
        CircuitState::Open => dispatcher.events.emit(DispatchEvent::CircuitOpened {
            next_retry_at: pipeline.next_circuit_retry().unwrap_or_else(Utc::now),
        }),
        CircuitState::HalfOpen => dispatcher.events.emit(DispatchEvent::CircuitHalfOpen),
        CircuitState::Closed => dispatcher.events.emit(DispatchEvent::CircuitClosed),
    }

    if let Some(metrics) = courier_metrics::try_metrics() {
        metrics.dispatch.record_circuit_transition(state.as_str());
    }

    *last = state;
}

fn handle_send_success(
    dispatcher: &Dispatcher,
    message: &QueuedMessage,
    receipt: &TransportReceipt,
    latency: Duration,
    now: DateTime<Utc>,
) {
    let Some(sent) =
        dispatcher
            .queue
            .mark_sent(message.id, &receipt.transport_message_id, latency, now)
    else {
        return;
    };

    tracing::debug!(
        message_id = %sent.id,
        tenant_id = %sent.tenant_id,
        transport_message_id = %receipt.transport_message_id,
        latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
        "Message delivered to provider"
    );

    dispatcher.events.emit(DispatchEvent::Sent {
        id: sent.id,
        tenant_id: sent.tenant_id.clone(),
        transport_message_id: receipt.transport_message_id.clone(),
        latency_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
    });

    if let Some(metrics) = courier_metrics::try_metrics() {
        let queue_secs = (now - sent.created_at).to_std().unwrap_or_default().as_secs_f64();
        metrics.dispatch.record_send_success(
            sent.tenant_id.as_str(),
            latency.as_secs_f64(),
            queue_secs,
            u64::from(sent.retry_count),
        );
    }
}

/// Decide what a failed attempt means for the message
///
/// Classification drives the outcome: credential problems and permanent
/// rejections fail the message immediately, everything else retries until
/// the per-message budget runs out.
fn handle_send_failure(
    dispatcher: &Dispatcher,
    message: &QueuedMessage,
    error: &TransportError,
    latency: Duration,
    now: DateTime<Utc>,
) {
    let kind = classify(error);
    let detail = error.to_string();

    if kind == ErrorKind::Authentication {
        tracing::error!(
            message_id = %message.id,
            tenant_id = %message.tenant_id,
            error = %detail,
            "Provider rejected credentials; check access token and phone number ID"
        );
        fail_terminally(dispatcher, message, kind, &detail, Some(latency), now);
        return;
    }

    if !kind.is_retryable() {
        tracing::warn!(
            message_id = %message.id,
            tenant_id = %message.tenant_id,
            error = %detail,
            "Permanent provider rejection, not retrying"
        );
        fail_terminally(dispatcher, message, kind, &detail, Some(latency), now);
        return;
    }

    if message.retries_remaining() == 0 {
        tracing::warn!(
            message_id = %message.id,
            tenant_id = %message.tenant_id,
            attempts = message.retry_count + 1,
            error = %detail,
            "Retry budget exhausted, message failed"
        );
        fail_terminally(dispatcher, message, kind, &detail, Some(latency), now);
        return;
    }

    let next_at = dispatcher.retry.next_retry_at(now, message.retry_count + 1);
    let Some((retry_count, resume_at)) =
        dispatcher
            .queue
            .reschedule_retry(message.id, kind, &detail, Some(latency), next_at, now)
    else {
        return;
    };

    tracing::info!(
        message_id = %message.id,
        attempt = retry_count,
        next_retry_at = %resume_at,
        error = %detail,
        "Scheduled retry with exponential backoff"
    );

    dispatcher.events.emit(DispatchEvent::Retrying {
        id: message.id,
        tenant_id: message.tenant_id.clone(),
        retry_count,
        next_attempt_at: resume_at,
        error: detail,
    });

    if let Some(metrics) = courier_metrics::try_metrics() {
        metrics.dispatch.record_retry(message.tenant_id.as_str());
    }
}

fn fail_terminally(
    dispatcher: &Dispatcher,
    message: &QueuedMessage,
    kind: ErrorKind,
    detail: &str,
    latency: Option<Duration>,
    now: DateTime<Utc>,
) {
    let Some(failed) = dispatcher
        .queue
        .mark_failed(message.id, kind, detail, latency, now)
    else {
        return;
    };

    dispatcher.events.emit(DispatchEvent::Failed {
        id: failed.id,
        tenant_id: failed.tenant_id.clone(),
        error: detail.to_string(),
    });

    if let Some(metrics) = courier_metrics::try_metrics() {
        metrics
            .dispatch
            .record_send_failure(failed.tenant_id.as_str(), kind.as_str());
    }
}

fn merge_wake(slot: &mut Option<DateTime<Utc>>, candidate: Option<DateTime<Utc>>) {
    if let Some(at) = candidate {
        *slot = Some(slot.map_or(at, |current| current.min(at)));
    }
}
