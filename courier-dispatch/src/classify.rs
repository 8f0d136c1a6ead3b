//! Transport error classification
//!
//! Maps raw [`TransportError`]s onto a small set of [`ErrorKind`]s that
//! drive retry and circuit breaker decisions. Classification is pure:
//! no IO, no clock, no state. Unrecognized errors classify as
//! [`ErrorKind::Permanent`] so that a new provider error can never
//! trigger an unbounded retry loop.

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Provider error codes that signal throttling
const RATE_LIMIT_CODES: [u32; 5] = [4, 80_007, 130_429, 131_048, 131_056];

/// Provider error codes that signal credential or permission problems
const AUTH_CODES: [u32; 5] = [0, 3, 10, 190, 200];

/// Provider error codes that signal a temporary provider-side fault
const TRANSIENT_CODES: [u32; 4] = [1, 2, 131_000, 131_016];

/// Message fragments that identify network-level failures
const NETWORK_FRAGMENTS: [&str; 6] = [
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "dns",
    "name resolution",
];

/// Behavioral class of a transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Temporary fault; retrying later may succeed
    Transient,
    /// Will never succeed as-is; retrying wastes quota
    Permanent,
    /// The provider is throttling us; retry after backing off
    RateLimit,
    /// Credentials are bad; retrying cannot help, an operator must act
    Authentication,
}

impl ErrorKind {
    /// Whether a failure of this kind earns the message another attempt
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimit)
    }

    /// Whether a failure of this kind counts against the circuit breaker
    ///
    /// Permanent and authentication failures say nothing about provider
    /// health, so they must not push the circuit toward opening.
    #[must_use]
    pub const fn affects_circuit(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimit)
    }

    /// Stable lowercase name, matching the serialized form
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::RateLimit => "rate_limit",
            Self::Authentication => "authentication",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a transport failure
///
/// Rules apply in order; the first match wins:
///
/// 1. HTTP 429 or a known throttling code is [`ErrorKind::RateLimit`]
/// 2. HTTP 401/403 or a known credential code is [`ErrorKind::Authentication`]
/// 3. HTTP 5xx or a known provider-fault code is [`ErrorKind::Transient`]
/// 4. Network-level failures (timeouts, resets, DNS) are [`ErrorKind::Transient`]
/// 5. Everything else is [`ErrorKind::Permanent`]
#[must_use]
pub fn classify(error: &TransportError) -> ErrorKind {
    match error {
        TransportError::Api {
            status,
            code,
            message,
        } => classify_api(*status, *code, message),
        TransportError::Io(io) => classify_io(io),
        TransportError::Timeout(_) | TransportError::ConnectionClosed => ErrorKind::Transient,
        TransportError::MalformedResponse(_) => ErrorKind::Permanent,
    }
}

fn classify_api(status: Option<u16>, code: Option<u32>, message: &str) -> ErrorKind {
    if status == Some(429) || code.is_some_and(|c| RATE_LIMIT_CODES.contains(&c)) {
        return ErrorKind::RateLimit;
    }

    if matches!(status, Some(401 | 403)) || code.is_some_and(|c| AUTH_CODES.contains(&c)) {
        return ErrorKind::Authentication;
    }

    if status.is_some_and(|s| (500..600).contains(&s))
        || code.is_some_and(|c| TRANSIENT_CODES.contains(&c))
    {
        return ErrorKind::Transient;
    }

    if is_network_message(message) {
        return ErrorKind::Transient;
    }

    ErrorKind::Permanent
}

fn classify_io(io: &std::io::Error) -> ErrorKind {
    use std::io::ErrorKind as IoKind;

    match io.kind() {
        IoKind::TimedOut
        | IoKind::ConnectionReset
        | IoKind::ConnectionRefused
        | IoKind::ConnectionAborted
        | IoKind::NotConnected
        | IoKind::BrokenPipe
        | IoKind::UnexpectedEof
        | IoKind::Interrupted => ErrorKind::Transient,
        _ if is_network_message(&io.to_string()) => ErrorKind::Transient,
        _ => ErrorKind::Permanent,
    }
}

fn is_network_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    NETWORK_FRAGMENTS
        .iter()
        .any(|fragment| lowered.contains(fragment))
}
