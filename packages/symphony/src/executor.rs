//! Single-attempt execution: registry lookup, context, middleware, handlers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::HandlerError;
use crate::handler::{HandlerContext, HandlerRegistry};
use crate::message::Envelope;
use crate::middleware::{MiddlewareStack, Terminal};

/// Outcome of one execution attempt.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Whether the attempt succeeded.
    pub success: bool,
    /// Wall-clock duration of the attempt.
    pub duration: Duration,
    /// The failure, when unsuccessful.
    pub error: Option<HandlerError>,
}

/// Runs one attempt of an envelope through the middleware stack and all
/// handlers registered for its message type.
pub struct Executor {
    registry: Arc<HandlerRegistry>,
    stack: MiddlewareStack,
}

impl Executor {
    /// Executor over a registry and middleware stack.
    pub fn new(registry: Arc<HandlerRegistry>, stack: MiddlewareStack) -> Self {
        Self { registry, stack }
    }

    /// The handler registry this executor resolves from.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Execute one attempt. Never panics and never returns a raw error; all
    /// failure detail lands in the result.
    pub async fn execute(
        &self,
        envelope: &Envelope,
        cancellation: CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();

        let ctx = Arc::new(HandlerContext {
            message_id: envelope.id,
            retry_count: envelope.delivery.retry_count,
            queue_name: envelope.queue_name.clone(),
            transport_name: envelope.transport_name.clone(),
            cancellation,
        });

        let registry = self.registry.clone();
        let terminal: Terminal = Arc::new(move |env, ctx| {
            let registry = registry.clone();
            Box::pin(async move {
                let handlers = registry.get_handlers(&env.message.message_type);
                if handlers.is_empty() {
                    return Err(anyhow::Error::new(HandlerError::permanent(format!(
                        "no handler registered for message type {:?}",
                        env.message.message_type
                    ))));
                }
                for handler in handlers {
                    handler.handle(&env.message, &ctx).await?;
                }
                Ok(())
            })
        });

        let outcome = self
            .stack
            .run(Arc::new(envelope.clone()), ctx, terminal)
            .await;
        let duration = started.elapsed();

        match outcome {
            Ok(()) => ExecutionResult {
                success: true,
                duration,
                error: None,
            },
            Err(err) => ExecutionResult {
                success: false,
                duration,
                error: Some(HandlerError::from_boundary(&err)),
            },
        }
    }
}
