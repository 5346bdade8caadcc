//! Canonical message and envelope model.
//!
//! A [`Message`] is what callers hand to the dispatcher: a type tag plus a
//! JSON object payload. An [`Envelope`] wraps one message with everything the
//! transports need: routing targets, priority, idempotency key, scheduling
//! and delivery bookkeeping.
//!
//! All timestamps serialize as ISO-8601 UTC strings on the wire; numeric
//! timestamps are rejected to avoid timezone ambiguity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::MessengerError;

/// A tagged application message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message type identifier, e.g. `"EmailRequested"`. Must match
    /// `^[A-Za-z][A-Za-z0-9_]*$`.
    #[serde(rename = "type")]
    pub message_type: String,

    /// Structured payload. Must be a JSON object.
    pub payload: Value,

    /// Optional free-form metadata attached by the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, Value>>,
}

impl Message {
    /// Build a message from a type tag and an object payload.
    pub fn new(message_type: impl Into<String>, payload: Value) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
            metadata: None,
        }
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Delivery bookkeeping carried on every envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryInfo {
    /// Handler-observed failures so far.
    pub retry_count: u32,
    /// Retry budget; once `retry_count` reaches this the envelope
    /// dead-letters.
    pub max_retries: u32,
    /// Number of times an expired lease was reclaimed. Diagnostic only;
    /// lease expiry is infrastructure failure, not a handler failure.
    #[serde(default)]
    pub reclaim_count: u32,
    /// Last failure message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Class of the last failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
}

impl DeliveryInfo {
    /// Fresh delivery info with the given retry budget.
    pub fn new(max_retries: u32) -> Self {
        Self {
            retry_count: 0,
            max_retries,
            reclaim_count: 0,
            last_error: None,
            error_class: None,
        }
    }
}

/// Lifecycle state of a persisted envelope.
///
/// `Acked` and `Dead` are terminal and write-once: stores must refuse to
/// transition a terminal row back to a live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeState {
    /// Persisted and waiting for a lease.
    #[default]
    Pending,
    /// Leased by a worker.
    InFlight,
    /// Successfully processed.
    Acked,
    /// Dead-lettered; retained for inspection.
    Dead,
}

impl EnvelopeState {
    /// Whether the state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Acked | Self::Dead)
    }

    /// Stable textual form, matching the persisted column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Acked => "acked",
            Self::Dead => "dead",
        }
    }

    /// Parse the persisted textual form.
    pub fn parse(s: &str) -> Result<Self, MessengerError> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "acked" => Ok(Self::Acked),
            "dead" => Ok(Self::Dead),
            other => Err(MessengerError::Serialization(format!(
                "unknown envelope state: {other}"
            ))),
        }
    }
}

/// A message wrapped with transport-level metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Stable unique identifier.
    pub id: Uuid,
    /// The wrapped message.
    pub message: Message,
    /// Target transport name. Matches `^[A-Za-z0-9_-]+$`.
    pub transport_name: String,
    /// Logical queue within the transport. Same grammar.
    pub queue_name: String,
    /// Priority `1..=10`, 10 highest.
    pub priority: u8,
    /// Optional deduplication token, scoped to the message type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Requested future visibility time, if the caller scheduled delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Earliest instant a consumer may lease this envelope.
    pub available_at: DateTime<Utc>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Retry and failure bookkeeping.
    pub delivery: DeliveryInfo,
}

impl Envelope {
    /// Whether the retry budget is exhausted.
    pub fn retries_exhausted(&self) -> bool {
        self.delivery.retry_count >= self.delivery.max_retries
    }
}

/// Serialize a message to its wire form.
pub fn serialize_message(message: &Message) -> Result<String, MessengerError> {
    serde_json::to_string(message).map_err(|e| MessengerError::Serialization(e.to_string()))
}

/// Deserialize a message from its wire form, validating structure.
pub fn deserialize_message(raw: &str) -> Result<Message, MessengerError> {
    let message: Message =
        serde_json::from_str(raw).map_err(|e| MessengerError::Serialization(e.to_string()))?;
    if message.message_type.is_empty() {
        return Err(MessengerError::Serialization(
            "message type must not be empty".to_string(),
        ));
    }
    if !message.payload.is_object() {
        return Err(MessengerError::Serialization(
            "message payload must be an object".to_string(),
        ));
    }
    Ok(message)
}

/// Serialize an envelope to its wire form. Dates become ISO-8601 UTC strings.
pub fn serialize_envelope(envelope: &Envelope) -> Result<String, MessengerError> {
    serde_json::to_string(envelope).map_err(|e| MessengerError::Serialization(e.to_string()))
}

/// Deserialize an envelope from its wire form.
pub fn deserialize_envelope(raw: &str) -> Result<Envelope, MessengerError> {
    let envelope: Envelope =
        serde_json::from_str(raw).map_err(|e| MessengerError::Serialization(e.to_string()))?;
    if !envelope.message.payload.is_object() {
        return Err(MessengerError::Serialization(
            "message payload must be an object".to_string(),
        ));
    }
    Ok(envelope)
}

/// A fresh message id (UUID v4).
pub fn new_message_id() -> Uuid {
    Uuid::new_v4()
}

/// Derive a textual idempotency key from a message and optional extras.
///
/// The key is a 32-bit FNV-1a digest of the canonical message JSON (plus
/// extras) suffixed with the millisecond timestamp: `"9f3a1c42-1735689600000"`.
pub fn new_idempotency_key(
    message: &Message,
    extras: Option<&Value>,
    now: DateTime<Utc>,
) -> Result<String, MessengerError> {
    let mut canonical = serialize_message(message)?;
    if let Some(extras) = extras {
        canonical.push_str(
            &serde_json::to_string(extras)
                .map_err(|e| MessengerError::Serialization(e.to_string()))?,
        );
    }
    Ok(format!(
        "{:08x}-{}",
        fnv1a_32(canonical.as_bytes()),
        now.timestamp_millis()
    ))
}

fn fnv1a_32(bytes: &[u8]) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    bytes.iter().fold(OFFSET, |hash, b| {
        (hash ^ u32::from(*b)).wrapping_mul(PRIME)
    })
}
