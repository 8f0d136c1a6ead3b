//! Core message model for outbound dispatch
//!
//! A [`QueuedMessage`] is the unit of outbound work: one payload, one
//! recipient, one owning tenant, plus the scheduling and retry bookkeeping
//! the dispatcher mutates as the message moves through its lifecycle.

use chrono::{DateTime, Utc};
use courier_common::TenantId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classify::ErrorKind;

/// Identifier for a queued message
///
/// A globally unique identifier (ULID) assigned at enqueue time. ULIDs are
/// lexicographically sortable by creation time and collision-resistant, which
/// makes them usable both as map keys and as stable ordering hints in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId {
    id: ulid::Ulid,
}

impl MessageId {
    /// Create a message ID from an existing ULID
    #[must_use]
    pub const fn new(id: ulid::Ulid) -> Self {
        Self { id }
    }

    /// Generate a new unique message ID
    #[must_use]
    pub fn generate() -> Self {
        Self {
            id: ulid::Ulid::new(),
        }
    }

    /// Get the underlying ULID
    #[must_use]
    pub const fn ulid(&self) -> ulid::Ulid {
        self.id
    }

    /// Get the timestamp (milliseconds since Unix epoch) encoded in this ULID
    ///
    /// Useful for observability and log correlation.
    #[must_use]
    pub const fn timestamp_ms(&self) -> u64 {
        self.id.timestamp_ms()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl std::str::FromStr for MessageId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ulid::Ulid::from_string(s).map(|id| Self { id })
    }
}

impl serde::Serialize for MessageId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.id.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for MessageId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let id = ulid::Ulid::from_string(&s).map_err(serde::de::Error::custom)?;
        Ok(Self { id })
    }
}

/// Dispatch priority for a message
///
/// Messages are dispatched strictly in priority order; within a priority
/// class, ordering is FIFO by creation time.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Dispatched before everything else (e.g. emergency callout alerts)
    Urgent,
    /// Time-sensitive notifications (e.g. technician en-route updates)
    High,
    /// Default for ordinary customer notifications
    #[default]
    Normal,
    /// Bulk or campaign traffic that can wait
    Low,
}

impl Priority {
    /// Number of distinct priority classes
    pub const COUNT: usize = 4;

    /// Dispatch lane index; lower ranks dispatch first
    #[must_use]
    pub const fn rank(self) -> usize {
        match self {
            Self::Urgent => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }

    /// Stable lowercase name, matching the serialized form
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

/// Lifecycle status of a queued message
///
/// Transitions are forward-only: a message that reaches a terminal status
/// (`Sent`, `Failed`, `Expired`, `Cancelled`) is never mutated again and is
/// removed from storage once the retention window passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Waiting for its scheduled time and an admission slot
    Queued,
    /// Waiting out a rate-limit-induced delay
    RateLimited,
    /// Claimed by a dispatch worker; transport call in flight
    Sending,
    /// Accepted by the transport (terminal)
    Sent,
    /// Permanently failed or retries exhausted (terminal)
    Failed,
    /// Deadline passed before a successful send (terminal)
    Expired,
    /// Explicitly cancelled by the producer (terminal)
    Cancelled,
}

impl MessageStatus {
    /// Whether a dispatch worker may claim a message in this status
    #[must_use]
    pub const fn is_claimable(self) -> bool {
        matches!(self, Self::Queued | Self::RateLimited)
    }

    /// Whether this status is terminal (no further transitions)
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Sent | Self::Failed | Self::Expired | Self::Cancelled
        )
    }

    /// Stable lowercase name, matching the serialized form
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::RateLimited => "rate_limited",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Interactive message flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractiveKind {
    /// Up to three tappable reply buttons
    Button,
    /// A list menu grouped into sections
    List,
}

/// A tappable reply button on an interactive message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub id: String,
    pub title: String,
}

/// One section of a list-style interactive message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSection {
    pub title: String,
    pub rows: Vec<ListRow>,
}

/// One selectable row inside a list section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRow {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Media attachment kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Document,
    Audio,
    Video,
}

/// The outbound payload, exactly one variant per message
///
/// The dispatcher never constructs or rewrites payloads; it stores whatever
/// the producer enqueued and hands it to the transport unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    /// Free-form text message
    Text { body: String },
    /// Pre-approved template with positional parameters
    Template {
        name: String,
        language: String,
        #[serde(default)]
        parameters: Vec<String>,
    },
    /// Interactive message with buttons or a list menu
    Interactive {
        kind: InteractiveKind,
        body: String,
        #[serde(default)]
        buttons: Vec<Button>,
        #[serde(default)]
        sections: Vec<ListSection>,
    },
    /// Media attachment by URL
    Media {
        kind: MediaKind,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
}

/// Interactive messages carry at most this many reply buttons
pub const MAX_INTERACTIVE_BUTTONS: usize = 3;

/// Validation failures for an enqueued payload
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Text body must not be empty")]
    EmptyBody,

    #[error("Template name and language are required")]
    IncompleteTemplate,

    #[error("Button-style interactive messages need 1 to {MAX_INTERACTIVE_BUTTONS} buttons")]
    InvalidButtonCount,

    #[error("List-style interactive messages need at least one section with rows")]
    EmptySections,

    #[error("Media messages need a URL")]
    MissingMediaUrl,
}

impl MessagePayload {
    /// Validate the payload before it enters the queue
    ///
    /// # Errors
    ///
    /// Returns a [`PayloadError`] describing the first constraint violated.
    pub fn validate(&self) -> Result<(), PayloadError> {
        match self {
            Self::Text { body } => {
                if body.trim().is_empty() {
                    return Err(PayloadError::EmptyBody);
                }
            }
            Self::Template { name, language, .. } => {
                if name.trim().is_empty() || language.trim().is_empty() {
                    return Err(PayloadError::IncompleteTemplate);
                }
            }
            Self::Interactive {
                kind,
                buttons,
                sections,
                ..
            } => match kind {
                InteractiveKind::Button => {
                    if buttons.is_empty() || buttons.len() > MAX_INTERACTIVE_BUTTONS {
                        return Err(PayloadError::InvalidButtonCount);
                    }
                }
                InteractiveKind::List => {
                    if sections.is_empty() || sections.iter().all(|s| s.rows.is_empty()) {
                        return Err(PayloadError::EmptySections);
                    }
                }
            },
            Self::Media { url, .. } => {
                if url.trim().is_empty() {
                    return Err(PayloadError::MissingMediaUrl);
                }
            }
        }

        Ok(())
    }

    /// Short variant name for logging and metrics labels
    #[must_use]
    pub const fn kind_str(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Template { .. } => "template",
            Self::Interactive { .. } => "interactive",
            Self::Media { .. } => "media",
        }
    }
}

/// Outcome of a single dispatch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Transport accepted the message
    Delivered,
    /// Transport call failed, classified by kind
    Failed(ErrorKind),
}

/// Record of one dispatch attempt, kept for operator forensics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchAttempt {
    /// When the attempt completed
    pub at: DateTime<Utc>,
    /// How the attempt ended
    pub outcome: AttemptOutcome,
    /// Round-trip time of the transport call, if it was made
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Error detail, absent on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A unit of outbound work owned by the message queue
///
/// Mutated exclusively by the dispatch loop (status, retry bookkeeping,
/// scheduling) or by an explicit producer cancel while still claimable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Unique identifier, assigned at enqueue time, immutable
    pub id: MessageId,
    /// Owning organization, used for rate limiting and statistics
    pub tenant_id: TenantId,
    /// Destination address (phone number in E.164 form)
    pub recipient: String,
    /// The payload handed to the transport
    pub payload: MessagePayload,
    /// Dispatch priority
    pub priority: Priority,
    /// Current lifecycle status
    pub status: MessageStatus,
    /// Retries consumed so far; never exceeds `max_retries`
    pub retry_count: u32,
    /// Retry budget for transient failures
    pub max_retries: u32,
    /// When the message was enqueued; FIFO order within a priority class
    pub created_at: DateTime<Utc>,
    /// Earliest eligible dispatch time; advanced on retry, never rewound
    pub scheduled_at: DateTime<Utc>,
    /// Optional hard deadline after which the message is abandoned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// When the most recent attempt completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Error detail from the most recent failed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the message reached a terminal status; drives retention
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Per-attempt history
    #[serde(default)]
    pub attempts: Vec<DispatchAttempt>,
    /// Identifier returned by the transport; set only once `Sent`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_message_id: Option<String>,
    /// Arrival order tiebreak within a priority class
    #[serde(skip)]
    pub(crate) seq: u64,
    /// Invalidates stale scheduling entries after a reschedule
    #[serde(skip)]
    pub(crate) epoch: u64,
}

impl QueuedMessage {
    /// Create a new message in `Queued` status, eligible immediately
    #[must_use]
    pub fn new(
        tenant_id: TenantId,
        recipient: impl Into<String>,
        payload: MessagePayload,
        priority: Priority,
        max_retries: u32,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();

        Self {
            id: MessageId::generate(),
            tenant_id,
            recipient: recipient.into(),
            payload,
            priority,
            status: MessageStatus::Queued,
            retry_count: 0,
            max_retries,
            created_at: now,
            scheduled_at: now,
            expires_at,
            last_attempt_at: None,
            last_error: None,
            completed_at: None,
            attempts: Vec::new(),
            transport_message_id: None,
            seq: 0,
            epoch: 0,
        }
    }

    /// Record a completed dispatch attempt
    pub fn record_attempt(&mut self, attempt: DispatchAttempt) {
        self.last_attempt_at = Some(attempt.at);
        self.attempts.push(attempt);
    }

    /// Number of attempts made so far
    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        u32::try_from(self.attempts.len()).unwrap_or(u32::MAX)
    }

    /// Retries still available before the message terminally fails
    #[must_use]
    pub const fn retries_remaining(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }

    /// Whether the hard deadline has passed
    #[must_use]
    pub fn has_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}
