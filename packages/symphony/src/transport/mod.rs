//! Pluggable transports.
//!
//! A transport persists and leases envelopes. The [`SyncTransport`] runs
//! handlers in the caller's execution before `send` resolves; the
//! [`DurableTransport`] persists through a [`MessageStore`] driver and hands
//! envelopes to polling workers with time-bounded leases.

mod durable;
mod memory;
mod store;
mod sync;

pub use durable::{DurableTransport, DEFAULT_LOCK_DURATION};
pub use memory::{InMemoryMessageStore, InMemoryScheduleStore};
pub use store::{
    InsertOutcome, MessageRow, MessageStore, ScheduleRow, ScheduleStore, ScheduleType, StoreError,
};
pub use sync::SyncTransport;

use crate::error::{HandlerError, MessengerError};
use crate::message::Envelope;
use uuid::Uuid;

/// Result of a send: the persisted (or deduplicated) envelope id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReceipt {
    /// Id of the envelope the caller should track.
    pub message_id: Uuid,
    /// Whether an existing envelope with the same `(type, idempotency_key)`
    /// absorbed this send.
    pub duplicate: bool,
}

impl SendReceipt {
    /// A receipt for a freshly persisted envelope.
    pub fn created(message_id: Uuid) -> Self {
        Self {
            message_id,
            duplicate: false,
        }
    }

    /// A receipt pointing at the existing duplicate.
    pub fn duplicate(message_id: Uuid) -> Self {
        Self {
            message_id,
            duplicate: true,
        }
    }
}

/// A message transport: send, lease, settle.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// The configured transport name.
    fn name(&self) -> &str;

    /// Persist an envelope (or run it inline, for the sync transport).
    ///
    /// Honors `scheduled_at`/`available_at` and collapses duplicates sharing
    /// `(message type, idempotency_key)` onto the existing envelope. The
    /// returned future resolves once delivery responsibility is taken: after
    /// persistence for durable transports, after handler completion for the
    /// sync transport.
    async fn send(&self, envelope: Envelope) -> Result<SendReceipt, MessengerError>;

    /// Persist a batch. Default: sequential sends.
    async fn send_batch(
        &self,
        envelopes: Vec<Envelope>,
    ) -> Result<Vec<SendReceipt>, MessengerError> {
        let mut receipts = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            receipts.push(self.send(envelope).await?);
        }
        Ok(receipts)
    }

    /// Atomically lease up to `batch_size` envelopes whose `available_at` has
    /// passed, ordered by priority (descending), then `available_at`, then
    /// `created_at`. Rows under an unexpired lease are skipped.
    async fn receive(
        &self,
        batch_size: usize,
        worker_id: &str,
    ) -> Result<Vec<Envelope>, MessengerError>;

    /// Settle a successfully processed envelope (`in_flight → acked`).
    async fn acknowledge(&self, envelope: &Envelope) -> Result<(), MessengerError>;

    /// Dead-letter an envelope, recording the failure.
    async fn reject(&self, envelope: &Envelope, error: &HandlerError)
        -> Result<(), MessengerError>;

    /// Count of pending plus in-flight (unexpired lease) envelopes,
    /// optionally restricted to one queue.
    async fn queue_depth(&self, queue: Option<&str>) -> Result<u64, MessengerError>;

    /// Optional transport-specific envelope check before send.
    fn validate_envelope(&self, _envelope: &Envelope) -> Result<(), MessengerError> {
        Ok(())
    }

    /// Reset abandoned leases (`in_flight` past `leased_until`) back to
    /// pending. Returns how many rows were reclaimed. No-op by default.
    async fn reclaim_expired_leases(&self) -> Result<u64, MessengerError> {
        Ok(0)
    }

    /// Extend the lease on an in-flight envelope (heartbeat). No-op by
    /// default.
    async fn extend_lease(&self, _envelope: &Envelope) -> Result<(), MessengerError> {
        Ok(())
    }
}
