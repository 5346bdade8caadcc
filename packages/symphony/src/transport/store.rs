//! Persistence driver traits and row models.
//!
//! The durable transport and the scheduler own their rows through these
//! traits; drivers (in-memory here, PostgreSQL in `symphony-postgres`) decide
//! how the rows are stored. Leasing must be atomic: a driver's `lease` marks
//! rows in-flight such that no two workers can observe the same row as
//! leasable.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::error::{is_retryable_message, MessengerError};
use crate::message::{DeliveryInfo, Envelope, EnvelopeState, Message};

/// Driver-level failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store failed (connection, query, constraint).
    #[error("store backend error: {0}")]
    Backend(String),

    /// A row could not be encoded or decoded.
    #[error("store serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Lift into the messenger taxonomy, attributing the failing transport.
    pub fn into_messenger(self, transport: &str) -> MessengerError {
        match self {
            StoreError::Backend(message) => {
                let retryable = is_retryable_message(&message);
                MessengerError::Transport {
                    name: transport.to_string(),
                    message,
                    retryable,
                }
            }
            StoreError::Serialization(message) => MessengerError::Serialization(message),
        }
    }
}

/// Outcome of an insert: fresh row or deduplicated onto an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new row was persisted.
    Created(Uuid),
    /// An existing row with the same `(type, idempotency_key)` absorbed the
    /// insert.
    Duplicate(Uuid),
}

impl InsertOutcome {
    /// The row id regardless of outcome.
    pub fn id(&self) -> Uuid {
        match self {
            Self::Created(id) | Self::Duplicate(id) => *id,
        }
    }

    /// Whether a new row was created.
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Persistent form of an envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRow {
    /// Envelope id.
    pub id: Uuid,
    /// Message type.
    pub message_type: String,
    /// Transport name.
    pub transport: String,
    /// Queue name.
    pub queue: String,
    /// Priority `1..=10`.
    pub priority: u8,
    /// Message payload.
    pub body: Value,
    /// Message metadata (`null` when absent).
    pub headers: Value,
    /// Deduplication key, scoped to the message type.
    pub idempotency_key: Option<String>,
    /// Earliest leasable instant.
    pub available_at: DateTime<Utc>,
    /// Caller-requested delivery time, if any.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Lease expiry while in flight.
    pub leased_until: Option<DateTime<Utc>>,
    /// Worker holding the lease.
    pub leased_by: Option<String>,
    /// Handler-observed failures.
    pub retry_count: u32,
    /// Retry budget.
    pub max_retries: u32,
    /// Lease reclamations (worker crashes), tracked separately from
    /// handler failures.
    pub reclaim_count: u32,
    /// Last failure message.
    pub last_error: Option<String>,
    /// Last failure class.
    pub error_class: Option<String>,
    /// Lifecycle state.
    pub state: EnvelopeState,
}

impl MessageRow {
    /// Persistent form of an envelope. State starts (or resets to) pending
    /// with no lease.
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            id: envelope.id,
            message_type: envelope.message.message_type.clone(),
            transport: envelope.transport_name.clone(),
            queue: envelope.queue_name.clone(),
            priority: envelope.priority,
            body: envelope.message.payload.clone(),
            headers: envelope
                .message
                .metadata
                .as_ref()
                .map(|m| Value::Object(m.clone()))
                .unwrap_or(Value::Null),
            idempotency_key: envelope.idempotency_key.clone(),
            available_at: envelope.available_at,
            scheduled_at: envelope.scheduled_at,
            created_at: envelope.created_at,
            leased_until: None,
            leased_by: None,
            retry_count: envelope.delivery.retry_count,
            max_retries: envelope.delivery.max_retries,
            reclaim_count: envelope.delivery.reclaim_count,
            last_error: envelope.delivery.last_error.clone(),
            error_class: envelope.delivery.error_class.clone(),
            state: EnvelopeState::Pending,
        }
    }

    /// Rebuild the envelope handed to workers.
    pub fn into_envelope(self) -> Envelope {
        let metadata = match self.headers {
            Value::Object(map) if !map.is_empty() => Some(map),
            _ => None,
        };
        Envelope {
            id: self.id,
            message: Message {
                message_type: self.message_type,
                payload: self.body,
                metadata,
            },
            transport_name: self.transport,
            queue_name: self.queue,
            priority: self.priority,
            idempotency_key: self.idempotency_key,
            scheduled_at: self.scheduled_at,
            available_at: self.available_at,
            created_at: self.created_at,
            delivery: DeliveryInfo {
                retry_count: self.retry_count,
                max_retries: self.max_retries,
                reclaim_count: self.reclaim_count,
                last_error: self.last_error,
                error_class: self.error_class,
            },
        }
    }
}

/// Driver behind the durable transport.
///
/// Terminal states are write-once: `mark_acked` / `mark_dead` only apply to
/// live rows, and `insert` must not resurrect a terminal row under the same
/// id.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a row, or upsert it when the id already exists on a live row
    /// (the retry path re-sends the same envelope id with updated delivery
    /// bookkeeping). Duplicate `(type, idempotency_key)` pairs on live rows
    /// collapse onto the existing row.
    async fn insert(&self, row: MessageRow) -> Result<InsertOutcome, StoreError>;

    /// Atomically lease up to `limit` rows that are leasable at `now`:
    /// pending rows whose `available_at` has passed, plus in-flight rows
    /// whose lease expired (those count as reclamations). Ordered by
    /// `(priority DESC, available_at ASC, created_at ASC)`.
    async fn lease(
        &self,
        queue: Option<&str>,
        worker_id: &str,
        limit: usize,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<MessageRow>, StoreError>;

    /// `in_flight → acked`. No-op on terminal rows.
    async fn mark_acked(&self, id: Uuid) -> Result<(), StoreError>;

    /// Transition a live row to `dead`, recording the failure and the final
    /// retry count. No-op on terminal rows.
    async fn mark_dead(
        &self,
        id: Uuid,
        error: &str,
        error_class: &str,
        retry_count: u32,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Reset expired in-flight rows to pending, incrementing
    /// `reclaim_count` (never `retry_count`). Returns the reclaimed count.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Extend the lease of an in-flight row.
    async fn extend_lease(&self, id: Uuid, leased_until: DateTime<Utc>) -> Result<(), StoreError>;

    /// Count pending plus unexpired in-flight rows, optionally per queue.
    async fn depth(&self, queue: Option<&str>, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Fetch one row.
    async fn get(&self, id: Uuid) -> Result<Option<MessageRow>, StoreError>;

    /// Find the live row holding `(message_type, key)`, if any.
    async fn find_by_idempotency_key(
        &self,
        message_type: &str,
        key: &str,
    ) -> Result<Option<Uuid>, StoreError>;

    /// Operator action: reset a dead row to pending with a fresh retry
    /// budget. Returns whether a dead row was found.
    async fn redispatch_dead(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError>;
}

/// Kind of schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleType {
    /// Fire once at a fixed instant.
    Once,
    /// Five-field cron expression.
    Cron,
    /// Fixed interval; recomputed from dispatch time (drifts when behind).
    Interval,
}

impl ScheduleType {
    /// Stable textual form, matching the persisted column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Cron => "cron",
            Self::Interval => "interval",
        }
    }

    /// Parse the persisted textual form.
    pub fn parse(s: &str) -> Result<Self, MessengerError> {
        match s {
            "once" => Ok(Self::Once),
            "cron" => Ok(Self::Cron),
            "interval" => Ok(Self::Interval),
            other => Err(MessengerError::Serialization(format!(
                "unknown schedule type: {other}"
            ))),
        }
    }
}

/// A persistent schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleRow {
    /// Schedule id.
    pub id: Uuid,
    /// Type of the messages this schedule materializes.
    pub message_type: String,
    /// Optional transport override for dispatched messages.
    pub transport: Option<String>,
    /// Payload of the materialized messages.
    pub body: Value,
    /// Metadata of the materialized messages (`null` when absent).
    pub headers: Value,
    /// Kind of schedule.
    pub schedule_type: ScheduleType,
    /// Kind-specific config: `{"at": ...}`, `{"cron": ...}` or
    /// `{"interval_ms": ...}`.
    pub schedule_config: Value,
    /// IANA timezone name for cron evaluation.
    pub timezone: String,
    /// Next fire time; `None` once exhausted.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Last fire time.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Fires so far.
    pub run_count: u32,
    /// Optional fire budget.
    pub max_runs: Option<u32>,
    /// Whether the scheduler considers this row.
    pub enabled: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

/// Driver behind the scheduler.
#[async_trait::async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Persist a new schedule.
    async fn insert(&self, row: ScheduleRow) -> Result<Uuid, StoreError>;

    /// Enabled rows with `next_run_at <= now`, ordered by `next_run_at`
    /// ascending, up to `limit`.
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduleRow>, StoreError>;

    /// Persist a modified row.
    async fn update(&self, row: &ScheduleRow) -> Result<(), StoreError>;

    /// Flip the enabled flag. Returns whether the row exists.
    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<bool, StoreError>;

    /// Fetch one row.
    async fn get(&self, id: Uuid) -> Result<Option<ScheduleRow>, StoreError>;

    /// Delete a row. Returns whether it existed.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;
}
