//! The public dispatch entry point.
//!
//! Validate, route, build the envelope, hand it to the transport. Transient
//! transport failures are retried internally with exponential backoff before
//! surfacing to the caller; handler failures from the sync transport surface
//! as-is.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::{Clock, IdGenerator};
use crate::config::RuntimeConfigManager;
use crate::error::MessengerError;
use crate::message::{DeliveryInfo, Envelope, Message};
use crate::routing::Router;
use crate::transport::Transport;
use crate::validate::{
    validate_idempotency_key, validate_message, validate_priority, validate_queue_name,
};

/// Default number of send attempts against a transport.
const DEFAULT_SEND_ATTEMPTS: u32 = 3;
/// Default base delay between send attempts (doubles per attempt).
const DEFAULT_SEND_BASE_DELAY: Duration = Duration::from_millis(100);

/// Named transport instances shared by the dispatcher and the workers.
#[derive(Default)]
pub struct TransportRegistry {
    map: RwLock<HashMap<String, Arc<dyn Transport>>>,
}

impl TransportRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a transport under its configured name.
    pub fn insert(&self, name: impl Into<String>, transport: Arc<dyn Transport>) {
        self.map
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), transport);
    }

    /// Look up a transport instance.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.map
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// All installed transports.
    pub fn all(&self) -> Vec<Arc<dyn Transport>> {
        self.map
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

/// Per-dispatch options.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Explicit transport; overrides routing.
    pub transport: Option<String>,
    /// Explicit queue; overrides transport/default config.
    pub queue: Option<String>,
    /// Explicit priority `1..=10`.
    pub priority: Option<u8>,
    /// Deduplication key, scoped to the message type.
    pub idempotency_key: Option<String>,
    /// Deliver no earlier than this instant.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Override the retry budget for this envelope.
    pub max_retries: Option<u32>,
    /// Abort the dispatch (not already-persisted work) after this long.
    pub deadline: Option<Duration>,
}

/// Result of a successful dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReceipt {
    /// Id of the envelope the caller should track.
    pub message_id: Uuid,
    /// Whether the send collapsed onto an existing envelope.
    pub duplicate: bool,
}

/// Validates, routes and sends messages.
pub struct Dispatcher {
    config: Arc<RuntimeConfigManager>,
    transports: Arc<TransportRegistry>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    router: Router,
    send_attempts: u32,
    send_base_delay: Duration,
}

impl Dispatcher {
    /// A dispatcher over the given config and transports.
    pub fn new(
        config: Arc<RuntimeConfigManager>,
        transports: Arc<TransportRegistry>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            config,
            transports,
            clock,
            ids,
            router: Router,
            send_attempts: DEFAULT_SEND_ATTEMPTS,
            send_base_delay: DEFAULT_SEND_BASE_DELAY,
        }
    }

    /// Override the internal send-retry policy.
    pub fn with_send_retry(mut self, attempts: u32, base_delay: Duration) -> Self {
        self.send_attempts = attempts.max(1);
        self.send_base_delay = base_delay;
        self
    }

    /// Dispatch a message: validate, route, enqueue. Returns the envelope id.
    pub async fn dispatch(
        &self,
        message: Message,
        options: DispatchOptions,
    ) -> Result<DispatchReceipt, MessengerError> {
        match options.deadline {
            Some(deadline) => tokio::time::timeout(deadline, self.dispatch_inner(message, &options))
                .await
                .map_err(|_| MessengerError::Transport {
                    name: "dispatch".to_string(),
                    message: format!("dispatch deadline of {deadline:?} exceeded"),
                    retryable: true,
                })?,
            None => self.dispatch_inner(message, &options).await,
        }
    }

    async fn dispatch_inner(
        &self,
        message: Message,
        options: &DispatchOptions,
    ) -> Result<DispatchReceipt, MessengerError> {
        validate_message(&message)?;
        if let Some(priority) = options.priority {
            validate_priority(priority)?;
        }
        if let Some(key) = &options.idempotency_key {
            validate_idempotency_key(key)?;
        }
        if let Some(queue) = &options.queue {
            validate_queue_name(queue)?;
        }

        let config = self.config.snapshot();

        let routing_priority = options.priority.unwrap_or(config.default_priority);
        let transport_name = self.router.resolve(
            &config,
            &message.message_type,
            options.transport.as_deref(),
            routing_priority,
        )?;
        let transport_config = config.transports.get(&transport_name);

        let priority = options
            .priority
            .or_else(|| transport_config.and_then(|t| t.priority))
            .unwrap_or(config.default_priority);
        let queue_name = options
            .queue
            .clone()
            .or_else(|| transport_config.and_then(|t| t.queue.clone()))
            .unwrap_or_else(|| config.default_queue.clone());
        let max_retries = options
            .max_retries
            .unwrap_or_else(|| config.retry_policy_for(&message.message_type).max_retries);

        let now = self.clock.now();
        let envelope = Envelope {
            id: self.ids.message_id(),
            message,
            transport_name: transport_name.clone(),
            queue_name,
            priority,
            idempotency_key: options.idempotency_key.clone(),
            scheduled_at: options.scheduled_at,
            available_at: options.scheduled_at.unwrap_or(now),
            created_at: now,
            delivery: DeliveryInfo::new(max_retries),
        };

        let transport = self.transports.get(&transport_name).ok_or_else(|| {
            MessengerError::Configuration(format!(
                "transport {transport_name:?} has no installed instance"
            ))
        })?;

        let receipt = self.send_with_retry(&*transport, envelope).await?;
        debug!(
            message_id = %receipt.message_id,
            transport = %transport_name,
            duplicate = receipt.duplicate,
            "message dispatched"
        );
        Ok(DispatchReceipt {
            message_id: receipt.message_id,
            duplicate: receipt.duplicate,
        })
    }

    /// Send with bounded exponential backoff on transient transport errors.
    async fn send_with_retry(
        &self,
        transport: &dyn Transport,
        envelope: Envelope,
    ) -> Result<crate::transport::SendReceipt, MessengerError> {
        let mut attempt = 0;
        loop {
            match transport.send(envelope.clone()).await {
                Ok(receipt) => return Ok(receipt),
                Err(err @ MessengerError::Transport { .. })
                    if err.is_retryable() && attempt + 1 < self.send_attempts =>
                {
                    let delay = self.send_base_delay * 2u32.pow(attempt);
                    warn!(
                        message_id = %envelope.id,
                        transport = transport.name(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transport send failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
