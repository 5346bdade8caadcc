//! In-process synchronous transport.
//!
//! Bypasses persistence entirely: `send` resolves the handlers and runs them
//! in the caller's execution, so the dispatch does not return until the
//! handler chain finishes. Used by tests and by message types that must
//! complete before the dispatcher returns.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{SendReceipt, Transport};
use crate::error::{HandlerError, MessengerError};
use crate::executor::Executor;
use crate::message::Envelope;

/// Transport that executes handlers inline.
pub struct SyncTransport {
    name: String,
    executor: Arc<Executor>,
}

impl SyncTransport {
    /// A sync transport running attempts through `executor`.
    pub fn new(name: impl Into<String>, executor: Arc<Executor>) -> Self {
        Self {
            name: name.into(),
            executor,
        }
    }
}

#[async_trait::async_trait]
impl Transport for SyncTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, envelope: Envelope) -> Result<SendReceipt, MessengerError> {
        debug!(
            message_id = %envelope.id,
            message_type = %envelope.message.message_type,
            "executing message inline"
        );

        let result = self
            .executor
            .execute(&envelope, CancellationToken::new())
            .await;
        if result.success {
            Ok(SendReceipt::created(envelope.id))
        } else {
            let error = result
                .error
                .unwrap_or_else(|| HandlerError::permanent("handler failed"));
            Err(MessengerError::Handler(error))
        }
    }

    async fn receive(
        &self,
        _batch_size: usize,
        _worker_id: &str,
    ) -> Result<Vec<Envelope>, MessengerError> {
        Ok(Vec::new())
    }

    async fn acknowledge(&self, _envelope: &Envelope) -> Result<(), MessengerError> {
        Ok(())
    }

    async fn reject(
        &self,
        _envelope: &Envelope,
        _error: &HandlerError,
    ) -> Result<(), MessengerError> {
        Ok(())
    }

    async fn queue_depth(&self, _queue: Option<&str>) -> Result<u64, MessengerError> {
        Ok(0)
    }
}
