//! Error types for the dispatch pipeline

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::message::{MessageId, PayloadError};

/// Failures surfaced by a [`Transport`](crate::transport::Transport)
/// implementation
///
/// These are the raw outcomes of a single send call, before classification.
/// The dispatcher never matches on variants directly for retry decisions;
/// that is the job of [`classify`](crate::classify::classify).
#[derive(Debug, Error)]
pub enum TransportError {
    /// The provider answered with an error response
    #[error("API error: status: {status:?}, code: {code:?}, message: {message}")]
    Api {
        /// HTTP status of the response, when one was received
        status: Option<u16>,
        /// Provider-specific error code from the response body
        code: Option<u32>,
        /// Human-readable error detail from the provider
        message: String,
    },

    /// IO error while talking to the provider
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The call exceeded the per-attempt deadline
    #[error("Transport call timed out after {0:?}")]
    Timeout(Duration),

    /// The provider answered with something we could not parse
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The connection dropped before a response arrived
    #[error("Connection closed before a response was received")]
    ConnectionClosed,
}

impl TransportError {
    /// Whether this error carries the given provider error code
    #[must_use]
    pub const fn has_code(&self, wanted: u32) -> bool {
        matches!(self, Self::Api { code: Some(code), .. } if *code == wanted)
    }

    /// HTTP status of the response, when one was received
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => *status,
            _ => None,
        }
    }
}

/// Failures surfaced by the dispatch service itself
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The circuit breaker is open; no transport call was made
    #[error("Circuit open until {next_retry_at}")]
    CircuitOpen {
        /// Earliest time a probe will be allowed through
        next_retry_at: DateTime<Utc>,
    },

    /// The transport call itself failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The payload failed validation at enqueue time
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] PayloadError),

    /// No message with this ID is known to the queue
    #[error("Unknown message: {0}")]
    UnknownMessage(MessageId),

    /// The dispatcher was used before `init` completed
    #[error("Dispatcher not initialized: {0}")]
    NotInitialized(String),

    /// The dispatcher is shutting down and no longer accepts work
    #[error("Dispatcher is shutting down")]
    Shutdown,
}

impl DispatchError {
    /// Whether this error means the circuit breaker rejected the call
    #[must_use]
    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Whether this error originated in the transport layer
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
