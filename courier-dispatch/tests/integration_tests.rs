//! End-to-end integration tests for the dispatch pipeline
//!
//! These tests drive the full flow from enqueue through the dispatch loop
//! to a mock transport, covering retries, rate limiting, circuit breaking,
//! expiry, cancellation, and graceful shutdown.
#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use courier_common::{Signal, TenantId};
use courier_dispatch::{
    CircuitState, CourierService, DispatchError, DispatchEvent, Dispatcher, EnqueueOptions,
    MessageStatus, Priority, TenantRateLimit, TransportError,
};
use support::MockTransport;
use tokio::{sync::broadcast, task::JoinHandle, time::sleep};

/// Configuration with short backoffs so scenarios finish quickly
fn fast_config() -> Dispatcher {
    let mut config = Dispatcher::default();
    config.max_concurrent_dispatches = 4;
    config.retry.base_delay_ms = 50;
    config.retry.max_delay_ms = 400;
    config.retry.jitter_factor = 0.0;
    config
}

/// Build a service around `transport` and spawn its dispatch loop
async fn start(
    config: Dispatcher,
    transport: Arc<MockTransport>,
) -> (
    CourierService,
    broadcast::Sender<Signal>,
    JoinHandle<Result<(), DispatchError>>,
) {
    let service = CourierService::with_config(config, transport);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(4);

    let serve_service = service.clone();
    let handle = tokio::spawn(async move { serve_service.serve(shutdown_rx).await });

    // Give the dispatch loop a moment to start
    sleep(Duration::from_millis(100)).await;

    (service, shutdown_tx, handle)
}

/// Signal shutdown and wait for the dispatch loop to exit cleanly
async fn stop(shutdown: &broadcast::Sender<Signal>, handle: JoinHandle<Result<(), DispatchError>>) {
    shutdown
        .send(Signal::Shutdown)
        .expect("dispatch loop should still be listening");

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("shutdown should complete promptly")
        .expect("serve task should not panic")
        .expect("serve should exit cleanly");
}

/// Receive events until one matches, skipping the rest
async fn await_event(
    events: &mut broadcast::Receiver<DispatchEvent>,
    deadline: Duration,
    mut matches: impl FnMut(&DispatchEvent) -> bool,
) -> DispatchEvent {
    tokio::time::timeout(deadline, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for a matching event")
}

/// Test the complete happy path: enqueue, dispatch, provider acceptance
#[tokio::test]
#[cfg_attr(miri, ignore = "Tokio timers are not supported in MIRI")]
async fn test_message_flows_from_enqueue_to_sent() {
    let transport = Arc::new(MockTransport::accepting());
    let (service, shutdown_tx, handle) = start(fast_config(), transport.clone()).await;

    let mut events = service.subscribe();
    let id = service
        .enqueue_text(
            TenantId::new("org_accept"),
            "+15550100",
            "Your technician is on the way",
            EnqueueOptions::default(),
        )
        .expect("enqueue should accept a valid payload");

    await_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, DispatchEvent::Enqueued { id: seen, .. } if *seen == id)
    })
    .await;
    await_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, DispatchEvent::Sent { id: seen, .. } if *seen == id)
    })
    .await;

    let message = service.message(id).expect("message should be retained");
    assert_eq!(message.status, MessageStatus::Sent);
    assert_eq!(message.retry_count, 0, "clean send should consume no retries");
    assert_eq!(message.attempts.len(), 1);
    assert!(
        message
            .transport_message_id
            .as_deref()
            .is_some_and(|pid| pid.starts_with("wamid.")),
        "provider id from the receipt should be recorded"
    );
    assert!(message.completed_at.is_some());

    assert_eq!(service.statistics(None).by_status.sent, 1);

    let status = service.service_status();
    assert!(status.available);
    assert_eq!(status.circuit_state, CircuitState::Closed);
    assert!(status.last_success.is_some());
    assert_eq!(status.rate_limiter.queued_messages, 0);
    assert!(
        status.success_rate.is_some_and(|rate| rate > 0.99),
        "every sampled send succeeded"
    );

    stop(&shutdown_tx, handle).await;
}

/// Test that transient failures are retried with growing delays
#[tokio::test]
#[cfg_attr(miri, ignore = "Tokio timers are not supported in MIRI")]
async fn test_transient_failure_retries_with_backoff_until_sent() {
    let transport = Arc::new(MockTransport::with_script([
        Err(TransportError::ConnectionClosed),
        Err(TransportError::ConnectionClosed),
    ]));
    let (service, shutdown_tx, handle) = start(fast_config(), transport.clone()).await;

    let mut events = service.subscribe();
    let started = Instant::now();
    let id = service
        .enqueue_text(
            TenantId::new("org_retry"),
            "+15550101",
            "Appointment reminder",
            EnqueueOptions::default(),
        )
        .unwrap();

    let first_retry = await_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, DispatchEvent::Retrying { id: seen, .. } if *seen == id)
    })
    .await;
    let DispatchEvent::Retrying { retry_count, .. } = first_retry else {
        panic!("expected a Retrying event");
    };
    assert_eq!(retry_count, 1);

    await_event(&mut events, Duration::from_secs(2), |event| {
        matches!(
            event,
            DispatchEvent::Retrying { id: seen, retry_count: 2, .. } if *seen == id
        )
    })
    .await;
    await_event(&mut events, Duration::from_secs(5), |event| {
        matches!(event, DispatchEvent::Sent { id: seen, .. } if *seen == id)
    })
    .await;

    assert!(
        started.elapsed() >= Duration::from_millis(120),
        "retries should be spaced by exponential backoff"
    );
    assert_eq!(transport.calls(), 3, "two failures plus the final success");

    let message = service.message(id).unwrap();
    assert_eq!(message.status, MessageStatus::Sent);
    assert_eq!(message.retry_count, 2);
    assert_eq!(message.attempts.len(), 3);

    stop(&shutdown_tx, handle).await;
}

/// Test that a permanent provider rejection fails without any retry
#[tokio::test]
#[cfg_attr(miri, ignore = "Tokio timers are not supported in MIRI")]
async fn test_permanent_rejection_fails_without_retry() {
    let transport = Arc::new(MockTransport::with_script([Err(TransportError::Api {
        status: Some(400),
        code: Some(131_026),
        message: "Receiver is not on WhatsApp".to_string(),
    })]));
    let (service, shutdown_tx, handle) = start(fast_config(), transport.clone()).await;

    let mut events = service.subscribe();
    let id = service
        .enqueue_text(
            TenantId::new("org_reject"),
            "+15550102",
            "Quote attached",
            EnqueueOptions::default(),
        )
        .unwrap();

    let failed = await_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, DispatchEvent::Failed { id: seen, .. } if *seen == id)
    })
    .await;
    let DispatchEvent::Failed { error, .. } = failed else {
        panic!("expected a Failed event");
    };
    assert!(error.contains("Receiver is not on WhatsApp"));

    assert_eq!(transport.calls(), 1, "permanent errors must not be retried");

    let message = service.message(id).unwrap();
    assert_eq!(message.status, MessageStatus::Failed);
    assert_eq!(message.retry_count, 0);

    stop(&shutdown_tx, handle).await;
}

/// Test that a message fails terminally once its retry budget runs out
#[tokio::test]
#[cfg_attr(miri, ignore = "Tokio timers are not supported in MIRI")]
async fn test_exhausted_retry_budget_fails_terminally() {
    let transport = Arc::new(MockTransport::with_script([
        Err(TransportError::ConnectionClosed),
        Err(TransportError::ConnectionClosed),
    ]));
    let (service, shutdown_tx, handle) = start(fast_config(), transport.clone()).await;

    let mut events = service.subscribe();
    let id = service
        .enqueue_text(
            TenantId::new("org_budget"),
            "+15550103",
            "Invoice ready",
            EnqueueOptions {
                max_retries: Some(1),
                ..EnqueueOptions::default()
            },
        )
        .unwrap();

    await_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, DispatchEvent::Retrying { id: seen, .. } if *seen == id)
    })
    .await;
    await_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, DispatchEvent::Failed { id: seen, .. } if *seen == id)
    })
    .await;

    assert_eq!(transport.calls(), 2, "one retry was budgeted, then terminal");

    let message = service.message(id).unwrap();
    assert_eq!(message.status, MessageStatus::Failed);
    assert_eq!(message.retry_count, 1);
    assert_eq!(service.statistics(None).by_status.failed, 1);

    stop(&shutdown_tx, handle).await;
}

/// Test that a provider throttle response consumes a retry and backs off
#[tokio::test]
#[cfg_attr(miri, ignore = "Tokio timers are not supported in MIRI")]
async fn test_provider_throttle_retries_after_backoff() {
    let transport = Arc::new(MockTransport::with_script([Err(TransportError::Api {
        status: Some(429),
        code: Some(130_429),
        message: "Rate limit hit".to_string(),
    })]));
    let (service, shutdown_tx, handle) = start(fast_config(), transport.clone()).await;

    let mut events = service.subscribe();
    let id = service
        .enqueue_text(
            TenantId::new("org_throttle"),
            "+15550104",
            "Schedule update",
            EnqueueOptions::default(),
        )
        .unwrap();

    await_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, DispatchEvent::Retrying { id: seen, .. } if *seen == id)
    })
    .await;
    await_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, DispatchEvent::Sent { id: seen, .. } if *seen == id)
    })
    .await;

    assert_eq!(transport.calls(), 2);
    assert_eq!(service.message(id).unwrap().retry_count, 1);

    stop(&shutdown_tx, handle).await;
}

/// Test that a send exceeding the per-attempt deadline counts as transient
#[tokio::test]
#[cfg_attr(miri, ignore = "Tokio timers are not supported in MIRI")]
async fn test_slow_provider_response_is_retried_as_timeout() {
    let transport = Arc::new(MockTransport::accepting());
    transport.set_response_delay(Some(Duration::from_millis(300)));

    let mut config = fast_config();
    config.transport_timeout_ms = 100;
    let (service, shutdown_tx, handle) = start(config, transport.clone()).await;

    let mut events = service.subscribe();
    let id = service
        .enqueue_text(
            TenantId::new("org_slow"),
            "+15550105",
            "Parts in stock",
            EnqueueOptions::default(),
        )
        .unwrap();

    let retrying = await_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, DispatchEvent::Retrying { id: seen, .. } if *seen == id)
    })
    .await;
    let DispatchEvent::Retrying { error, .. } = retrying else {
        panic!("expected a Retrying event");
    };
    assert!(error.contains("timed out"));

    // Let the provider answer in time for the retry
    transport.set_response_delay(None);

    await_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, DispatchEvent::Sent { id: seen, .. } if *seen == id)
    })
    .await;

    assert_eq!(transport.calls(), 2, "the timed-out call still reached the provider");
    assert_eq!(service.message(id).unwrap().retry_count, 1);

    stop(&shutdown_tx, handle).await;
}

/// Test that consecutive failures open the circuit and probes close it again
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[cfg_attr(miri, ignore = "Tokio timers are not supported in MIRI")]
async fn test_circuit_opens_after_consecutive_failures_and_recovers() {
    let transport = Arc::new(MockTransport::with_script([
        Err(TransportError::ConnectionClosed),
        Err(TransportError::ConnectionClosed),
    ]));

    let mut config = fast_config();
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.open_duration_ms = 300;
    config.circuit_breaker.success_threshold = 1;
    config.circuit_breaker.half_open_requests = 1;
    let (service, shutdown_tx, handle) = start(config, transport.clone()).await;

    let mut events = service.subscribe();
    let no_retries = EnqueueOptions {
        max_retries: Some(0),
        ..EnqueueOptions::default()
    };
    let tenant = TenantId::new("org_breaker");

    let first = service
        .enqueue_text(tenant.clone(), "+15550106", "one", no_retries.clone())
        .unwrap();
    await_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, DispatchEvent::Failed { id, .. } if *id == first)
    })
    .await;

    let second = service
        .enqueue_text(tenant.clone(), "+15550106", "two", no_retries)
        .unwrap();
    await_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, DispatchEvent::Failed { id, .. } if *id == second)
    })
    .await;
    await_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, DispatchEvent::CircuitOpened { .. })
    })
    .await;

    assert!(!service.service_status().available);

    // While the circuit is open nothing is claimed
    let third = service
        .enqueue_text(tenant, "+15550106", "three", EnqueueOptions::default())
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        transport.calls(),
        2,
        "messages must wait out the open window"
    );
    assert_eq!(service.message(third).unwrap().status, MessageStatus::Queued);

    await_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, DispatchEvent::CircuitHalfOpen)
    })
    .await;
    await_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, DispatchEvent::Sent { id, .. } if *id == third)
    })
    .await;
    await_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, DispatchEvent::CircuitClosed)
    })
    .await;

    let message = service.message(third).unwrap();
    assert_eq!(
        message.retry_count, 0,
        "waiting out the open window must not consume the retry budget"
    );
    assert_eq!(transport.calls(), 3);
    assert!(service.service_status().available);

    stop(&shutdown_tx, handle).await;
}

/// Test that one tenant hitting its rate limit does not delay another
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[cfg_attr(miri, ignore = "Tokio timers are not supported in MIRI")]
async fn test_tenant_rate_limit_does_not_starve_other_tenants() {
    let transport = Arc::new(MockTransport::accepting());

    let mut config = fast_config();
    config.rate_limit.tenant_limits.insert(
        "org_busy".to_string(),
        TenantRateLimit {
            messages_per_second: 0.5,
            burst_size: 1,
        },
    );
    let (service, shutdown_tx, handle) = start(config, transport.clone()).await;

    let mut events = service.subscribe();
    let busy = TenantId::new("org_busy");
    let busy_first = service
        .enqueue_text(busy.clone(), "+15550107", "first", EnqueueOptions::default())
        .unwrap();
    let busy_second = service
        .enqueue_text(busy, "+15550107", "second", EnqueueOptions::default())
        .unwrap();
    let quiet = service
        .enqueue_text(
            TenantId::new("org_quiet"),
            "+15550108",
            "hello",
            EnqueueOptions::default(),
        )
        .unwrap();

    await_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, DispatchEvent::RateLimited { id, .. } if *id == busy_second)
    })
    .await;
    await_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, DispatchEvent::Sent { id, .. } if *id == quiet)
    })
    .await;

    assert_eq!(
        service.message(busy_second).unwrap().status,
        MessageStatus::RateLimited,
        "the busy tenant's overflow stays parked while others dispatch"
    );

    // The parked message resumes once the tenant bucket refills
    await_event(&mut events, Duration::from_secs(5), |event| {
        matches!(event, DispatchEvent::Sent { id, .. } if *id == busy_second)
    })
    .await;

    assert_eq!(service.message(busy_first).unwrap().status, MessageStatus::Sent);
    assert_eq!(transport.calls(), 3);

    stop(&shutdown_tx, handle).await;
}

/// Test that dispatch order follows priority, not arrival order
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[cfg_attr(miri, ignore = "Tokio timers are not supported in MIRI")]
async fn test_higher_priority_dispatches_first() {
    let transport = Arc::new(MockTransport::accepting());

    let mut config = fast_config();
    config.max_concurrent_dispatches = 1;
    let service = CourierService::with_config(config, transport.clone());

    // Enqueue before the loop starts so priority alone decides the order
    let tenant = TenantId::new("org_priority");
    let low = service
        .enqueue_text(
            tenant.clone(),
            "+15550109",
            "newsletter",
            EnqueueOptions::with_priority(Priority::Low),
        )
        .unwrap();
    let normal = service
        .enqueue_text(
            tenant.clone(),
            "+15550109",
            "confirmation",
            EnqueueOptions::with_priority(Priority::Normal),
        )
        .unwrap();
    let urgent = service
        .enqueue_text(
            tenant.clone(),
            "+15550109",
            "emergency dispatch",
            EnqueueOptions::with_priority(Priority::Urgent),
        )
        .unwrap();
    let high = service
        .enqueue_text(
            tenant,
            "+15550109",
            "otp code",
            EnqueueOptions::with_priority(Priority::High),
        )
        .unwrap();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
    let serve_service = service.clone();
    let handle = tokio::spawn(async move { serve_service.serve(shutdown_rx).await });

    assert!(
        transport.wait_for_calls(4, Duration::from_secs(5)).await,
        "all four messages should dispatch"
    );
    assert_eq!(
        transport.sent_ids(),
        vec![urgent, high, normal, low],
        "dispatch order should follow priority"
    );

    stop(&shutdown_tx, handle).await;
}

/// Test that a message past its deadline is abandoned without a send
#[tokio::test]
#[cfg_attr(miri, ignore = "Tokio timers are not supported in MIRI")]
async fn test_expired_message_is_abandoned_unsent() {
    let transport = Arc::new(MockTransport::accepting());
    let (service, shutdown_tx, handle) = start(fast_config(), transport.clone()).await;

    let mut events = service.subscribe();
    let id = service
        .enqueue_text(
            TenantId::new("org_expiry"),
            "+15550110",
            "flash sale ends now",
            EnqueueOptions {
                expires_at: Some(chrono::Utc::now() - chrono::Duration::milliseconds(50)),
                ..EnqueueOptions::default()
            },
        )
        .unwrap();

    await_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, DispatchEvent::Expired { id: seen, .. } if *seen == id)
    })
    .await;

    assert_eq!(transport.calls(), 0, "expired messages never reach the provider");

    let message = service.message(id).unwrap();
    assert_eq!(message.status, MessageStatus::Expired);
    assert!(message.completed_at.is_some());

    stop(&shutdown_tx, handle).await;
}

/// Test that cancellation removes a queued message before dispatch
#[tokio::test]
#[cfg_attr(miri, ignore = "Tokio timers are not supported in MIRI")]
async fn test_cancel_prevents_dispatch() {
    let transport = Arc::new(MockTransport::accepting());

    let service = CourierService::with_config(fast_config(), transport.clone());
    let mut events = service.subscribe();
    let id = service
        .enqueue_text(
            TenantId::new("org_cancel"),
            "+15550111",
            "draft",
            EnqueueOptions::default(),
        )
        .unwrap();

    assert!(service.cancel(id), "a queued message is cancellable");
    await_event(&mut events, Duration::from_secs(2), |event| {
        matches!(event, DispatchEvent::Cancelled { id: seen, .. } if *seen == id)
    })
    .await;
    assert!(!service.cancel(id), "terminal messages are not cancellable");

    // Start the loop afterwards; the cancelled message must stay untouched
    let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
    let serve_service = service.clone();
    let handle = tokio::spawn(async move { serve_service.serve(shutdown_rx).await });
    sleep(Duration::from_millis(150)).await;

    assert_eq!(transport.calls(), 0);
    assert_eq!(service.message(id).unwrap().status, MessageStatus::Cancelled);

    stop(&shutdown_tx, handle).await;
}

/// Test that shutdown waits for in-flight sends before exiting
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[cfg_attr(miri, ignore = "Tokio timers are not supported in MIRI")]
async fn test_graceful_shutdown_completes_in_flight_sends() {
    let transport = Arc::new(MockTransport::accepting());
    transport.set_response_delay(Some(Duration::from_millis(300)));

    let (service, shutdown_tx, handle) = start(fast_config(), transport.clone()).await;

    let id = service
        .enqueue_text(
            TenantId::new("org_drain"),
            "+15550112",
            "closing soon",
            EnqueueOptions::default(),
        )
        .unwrap();

    assert!(
        transport.wait_for_calls(1, Duration::from_secs(2)).await,
        "the send should be in flight before shutdown"
    );

    let started = Instant::now();
    stop(&shutdown_tx, handle).await;

    assert!(
        started.elapsed() < Duration::from_secs(3),
        "drain should finish as soon as the in-flight send completes"
    );
    assert_eq!(
        service.message(id).unwrap().status,
        MessageStatus::Sent,
        "the in-flight send should complete during drain"
    );
}

/// Test that shutdown returns promptly when nothing is in flight
#[tokio::test]
#[cfg_attr(miri, ignore = "Tokio timers are not supported in MIRI")]
async fn test_graceful_shutdown_is_prompt_when_idle() {
    let transport = Arc::new(MockTransport::accepting());
    let (_service, shutdown_tx, handle) = start(fast_config(), transport).await;

    let started = Instant::now();
    stop(&shutdown_tx, handle).await;

    assert!(
        started.elapsed() < Duration::from_secs(2),
        "an idle dispatcher should stop immediately"
    );
}
