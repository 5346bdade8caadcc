//! Durable transport over a [`MessageStore`] driver.
//!
//! Persists envelopes and hands them to polling workers under time-bounded
//! leases. The lease is the per-envelope mutual-exclusion primitive: a row a
//! worker holds is invisible to others until `leased_until` passes.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::store::{InsertOutcome, MessageRow, MessageStore};
use super::{SendReceipt, Transport};
use crate::clock::Clock;
use crate::error::{HandlerError, MessengerError};
use crate::message::Envelope;
use crate::validate::{validate_priority, validate_queue_name};

/// Default lease TTL.
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(300);

/// Database-backed transport.
pub struct DurableTransport {
    name: String,
    store: Arc<dyn MessageStore>,
    clock: Arc<dyn Clock>,
    lock_duration: Duration,
}

impl DurableTransport {
    /// A durable transport over `store` with the default lease TTL.
    pub fn new(name: impl Into<String>, store: Arc<dyn MessageStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            store,
            clock,
            lock_duration: DEFAULT_LOCK_DURATION,
        }
    }

    /// Override the lease TTL.
    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    /// The configured lease TTL.
    pub fn lock_duration(&self) -> Duration {
        self.lock_duration
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }
}

#[async_trait::async_trait]
impl Transport for DurableTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, envelope: Envelope) -> Result<SendReceipt, MessengerError> {
        self.validate_envelope(&envelope)?;

        // Fast-path dedupe before touching the row. The store repeats the
        // check under its own atomicity as the race backstop.
        if let Some(key) = &envelope.idempotency_key {
            if let Some(existing) = self
                .store
                .find_by_idempotency_key(&envelope.message.message_type, key)
                .await
                .map_err(|e| e.into_messenger(&self.name))?
            {
                if existing != envelope.id {
                    debug!(
                        message_id = %existing,
                        idempotency_key = %key,
                        "send collapsed onto existing envelope"
                    );
                    return Ok(SendReceipt::duplicate(existing));
                }
            }
        }

        let outcome = self
            .store
            .insert(MessageRow::from_envelope(&envelope))
            .await
            .map_err(|e| e.into_messenger(&self.name))?;

        Ok(match outcome {
            InsertOutcome::Created(id) => SendReceipt::created(id),
            InsertOutcome::Duplicate(id) => SendReceipt::duplicate(id),
        })
    }

    async fn receive(
        &self,
        batch_size: usize,
        worker_id: &str,
    ) -> Result<Vec<Envelope>, MessengerError> {
        let rows = self
            .store
            .lease(
                None,
                worker_id,
                batch_size,
                self.lock_duration,
                self.clock.now(),
            )
            .await
            .map_err(|e| e.into_messenger(&self.name))?;

        Ok(rows.into_iter().map(MessageRow::into_envelope).collect())
    }

    async fn acknowledge(&self, envelope: &Envelope) -> Result<(), MessengerError> {
        self.store
            .mark_acked(envelope.id)
            .await
            .map_err(|e| e.into_messenger(&self.name))
    }

    async fn reject(
        &self,
        envelope: &Envelope,
        error: &HandlerError,
    ) -> Result<(), MessengerError> {
        self.store
            .mark_dead(
                envelope.id,
                &error.message,
                &error.class,
                envelope.delivery.retry_count,
                self.clock.now(),
            )
            .await
            .map_err(|e| e.into_messenger(&self.name))
    }

    async fn queue_depth(&self, queue: Option<&str>) -> Result<u64, MessengerError> {
        self.store
            .depth(queue, self.clock.now())
            .await
            .map_err(|e| e.into_messenger(&self.name))
    }

    fn validate_envelope(&self, envelope: &Envelope) -> Result<(), MessengerError> {
        validate_priority(envelope.priority)?;
        validate_queue_name(&envelope.queue_name)?;
        if let Some(scheduled_at) = envelope.scheduled_at {
            if envelope.available_at < scheduled_at {
                return Err(MessengerError::Validation(
                    "available_at must not precede scheduled_at".to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn reclaim_expired_leases(&self) -> Result<u64, MessengerError> {
        self.store
            .reclaim_expired(self.clock.now())
            .await
            .map_err(|e| e.into_messenger(&self.name))
    }

    async fn extend_lease(&self, envelope: &Envelope) -> Result<(), MessengerError> {
        let leased_until = self.clock.now()
            + chrono::Duration::milliseconds(self.lock_duration.as_millis() as i64);
        self.store
            .extend_lease(envelope.id, leased_until)
            .await
            .map_err(|e| e.into_messenger(&self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::message::{DeliveryInfo, EnvelopeState, Message};
    use crate::transport::InMemoryMessageStore;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn envelope(key: Option<&str>) -> Envelope {
        Envelope {
            id: Uuid::new_v4(),
            message: Message::new("Work", json!({ "k": "a" })),
            transport_name: "durable".to_string(),
            queue_name: "default".to_string(),
            priority: 5,
            idempotency_key: key.map(str::to_string),
            scheduled_at: None,
            available_at: Utc::now(),
            created_at: Utc::now(),
            delivery: DeliveryInfo::new(3),
        }
    }

    fn transport() -> (DurableTransport, Arc<InMemoryMessageStore>, Arc<ManualClock>) {
        let store = Arc::new(InMemoryMessageStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let transport = DurableTransport::new("durable", store.clone(), clock.clone());
        (transport, store, clock)
    }

    #[tokio::test]
    async fn send_persists_and_receive_round_trips() {
        let (transport, _store, _clock) = transport();
        let env = envelope(None);

        let receipt = transport.send(env.clone()).await.unwrap();
        assert_eq!(receipt.message_id, env.id);
        assert!(!receipt.duplicate);

        let received = transport.receive(10, "w1").await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message, env.message);
    }

    #[tokio::test]
    async fn duplicate_send_returns_the_first_id() {
        let (transport, store, _clock) = transport();
        let first = envelope(Some("k1"));
        let first_id = first.id;
        transport.send(first).await.unwrap();

        let receipt = transport.send(envelope(Some("k1"))).await.unwrap();
        assert!(receipt.duplicate);
        assert_eq!(receipt.message_id, first_id);
        assert_eq!(store.rows().len(), 1);
    }

    #[tokio::test]
    async fn resending_own_id_reschedules_instead_of_deduplicating() {
        // The retry path re-sends the same envelope id with updated delivery
        // bookkeeping; the idempotency check must not bounce it.
        let (transport, store, clock) = transport();
        let mut env = envelope(Some("k1"));
        transport.send(env.clone()).await.unwrap();
        transport.receive(10, "w1").await.unwrap();

        env.delivery.retry_count = 1;
        env.delivery.last_error = Some("timeout".to_string());
        env.available_at = clock.now() + chrono::Duration::milliseconds(200);

        let receipt = transport.send(env.clone()).await.unwrap();
        assert_eq!(receipt.message_id, env.id);

        let row = store.get(env.id).await.unwrap().unwrap();
        assert_eq!(row.state, EnvelopeState::Pending);
        assert_eq!(row.retry_count, 1);
        assert_eq!(row.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn reject_records_failure_detail() {
        let (transport, store, _clock) = transport();
        let env = envelope(None);
        transport.send(env.clone()).await.unwrap();

        transport
            .reject(&env, &HandlerError::permanent("bad input"))
            .await
            .unwrap();

        let row = store.get(env.id).await.unwrap().unwrap();
        assert_eq!(row.state, EnvelopeState::Dead);
        assert_eq!(row.last_error.as_deref(), Some("bad input"));
    }

    #[tokio::test]
    async fn queue_depth_tracks_live_rows() {
        let (transport, _store, _clock) = transport();
        transport.send(envelope(None)).await.unwrap();
        transport.send(envelope(None)).await.unwrap();
        assert_eq!(transport.queue_depth(None).await.unwrap(), 2);

        let received = transport.receive(1, "w1").await.unwrap();
        transport.acknowledge(&received[0]).await.unwrap();
        assert_eq!(transport.queue_depth(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reclaim_returns_expired_leases_to_pending() {
        let (transport, store, clock) = transport();
        let transport = transport.with_lock_duration(Duration::from_secs(5));
        let env = envelope(None);
        transport.send(env.clone()).await.unwrap();
        transport.receive(10, "w1").await.unwrap();

        clock.advance(chrono::Duration::seconds(6));
        assert_eq!(transport.reclaim_expired_leases().await.unwrap(), 1);

        let row = store.get(env.id).await.unwrap().unwrap();
        assert_eq!(row.state, EnvelopeState::Pending);
        assert_eq!(row.reclaim_count, 1);
        assert_eq!(row.retry_count, 0);
    }

    #[tokio::test]
    async fn validate_envelope_rejects_bad_shapes() {
        let (transport, _store, _clock) = transport();

        let mut bad_priority = envelope(None);
        bad_priority.priority = 0;
        assert!(transport.send(bad_priority).await.is_err());

        let mut bad_schedule = envelope(None);
        bad_schedule.scheduled_at = Some(Utc::now() + chrono::Duration::hours(1));
        bad_schedule.available_at = Utc::now();
        assert!(transport.send(bad_schedule).await.is_err());
    }
}
