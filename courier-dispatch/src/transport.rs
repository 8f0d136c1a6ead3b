//! Transport abstraction over the messaging provider
//!
//! The dispatcher is provider-agnostic: everything it knows about the
//! outside world goes through [`Transport`]. Implementations own their
//! HTTP client, credentials, and serialization; the dispatcher owns
//! deadlines, retries, rate limiting, and circuit breaking.

use async_trait::async_trait;

use crate::{error::TransportError, message::QueuedMessage};

/// Acknowledgment returned by the provider for an accepted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportReceipt {
    /// Provider-assigned identifier for the accepted message
    pub transport_message_id: String,
}

impl TransportReceipt {
    #[must_use]
    pub fn new(transport_message_id: impl Into<String>) -> Self {
        Self {
            transport_message_id: transport_message_id.into(),
        }
    }
}

/// A single-message send to the upstream provider
///
/// Implementations must be cheap to call concurrently; the dispatcher
/// issues up to its configured concurrency limit of sends at once.
/// Cancellation safety is not required: the dispatcher wraps every call
/// in its own deadline and treats an elapsed deadline as a failed
/// attempt regardless of what the provider eventually did.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Deliver one message to the provider
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] describing why the provider did not
    /// accept the message. Implementations should surface provider error
    /// codes and HTTP statuses through [`TransportError::Api`] so that
    /// classification can tell throttling from credential problems.
    async fn send(&self, message: &QueuedMessage) -> Result<TransportReceipt, TransportError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transport for in-crate tests

    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use parking_lot::Mutex;

    use super::{Transport, TransportReceipt, async_trait};
    use crate::{
        error::TransportError,
        message::{MessageId, QueuedMessage},
    };

    /// Transport that replays a queue of pre-scripted outcomes
    ///
    /// Once the script runs dry every further call succeeds, so tests only
    /// script the interesting prefix.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedTransport {
        script: Mutex<VecDeque<Result<TransportReceipt, TransportError>>>,
        sent: Mutex<Vec<MessageId>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        pub(crate) fn succeeding() -> Self {
            Self::default()
        }

        pub(crate) fn with_script(
            script: impl IntoIterator<Item = Result<TransportReceipt, TransportError>>,
        ) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                ..Self::default()
            }
        }

        pub(crate) fn push(&self, outcome: Result<TransportReceipt, TransportError>) {
            self.script.lock().push_back(outcome);
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub(crate) fn sent_ids(&self) -> Vec<MessageId> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, message: &QueuedMessage) -> Result<TransportReceipt, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.sent.lock().push(message.id);

            match self.script.lock().pop_front() {
                Some(outcome) => outcome,
                None => Ok(TransportReceipt::new(format!("wamid.{}", message.id))),
            }
        }
    }
}
