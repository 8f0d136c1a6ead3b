//! Mock transport for integration testing
//!
//! This module provides a configurable transport double that can:
#![allow(dead_code)] // Test utility module - not all methods used in every test
//! - Replay a scripted sequence of send outcomes
//! - Accept every message once the script runs dry
//! - Delay responses to exercise the per-attempt deadline
//! - Record which messages the provider saw, in order
//! - Wake waiters once a given number of calls has arrived

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use courier_dispatch::{MessageId, QueuedMessage, Transport, TransportError, TransportReceipt};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Transport double that records every call it receives
///
/// Outcomes are consumed front-to-back from the script in call arrival
/// order; once the script is empty every further call is accepted, so
/// tests only script the interesting prefix of a scenario.
#[derive(Debug, Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<Result<TransportReceipt, TransportError>>>,
    response_delay: Mutex<Option<Duration>>,
    sent: Mutex<Vec<MessageId>>,
    calls: AtomicUsize,
    call_made: Notify,
}

impl MockTransport {
    /// Transport that accepts every message
    #[must_use]
    pub fn accepting() -> Self {
        Self::default()
    }

    /// Transport that replays `script`, then accepts everything
    #[must_use]
    pub fn with_script(
        script: impl IntoIterator<Item = Result<TransportReceipt, TransportError>>,
    ) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Append one more outcome to the script
    pub fn push(&self, outcome: Result<TransportReceipt, TransportError>) {
        self.script.lock().push_back(outcome);
    }

    /// Delay every response, simulating a slow provider
    pub fn set_response_delay(&self, delay: Option<Duration>) {
        *self.response_delay.lock() = delay;
    }

    /// Number of send calls received so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Message IDs in the order the provider saw them
    pub fn sent_ids(&self) -> Vec<MessageId> {
        self.sent.lock().clone()
    }

    /// Wait until at least `count` send calls have been received
    ///
    /// Returns `false` if `deadline` elapses first. The counter ticks when
    /// a call reaches the transport, not when the dispatcher has finished
    /// processing its outcome; synchronize on events for state assertions.
    pub async fn wait_for_calls(&self, count: usize, deadline: Duration) -> bool {
        tokio::time::timeout(deadline, async {
            loop {
                let notified = self.call_made.notified();
                if self.calls() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, message: &QueuedMessage) -> Result<TransportReceipt, TransportError> {
        let outcome = self.script.lock().pop_front();
        self.sent.lock().push(message.id);
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_made.notify_waiters();

        let delay = *self.response_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match outcome {
            Some(outcome) => outcome,
            None => Ok(TransportReceipt::new(format!("wamid.{}", message.id))),
        }
    }
}
