//! Handler middleware.
//!
//! A middleware chain wraps handler execution with cross-cutting concerns.
//! Each middleware receives the envelope, the handler context, and a [`Next`]
//! continuation it must run exactly once — unless it short-circuits.
//!
//! Default stack, outermost first: error handling, then the optional
//! validation, performance and logging layers, then the handlers.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::error::HandlerError;
use crate::handler::HandlerContext;
use crate::message::Envelope;
use crate::metrics::{AttemptRecord, MetricsCollector};
use crate::validate::validate_message;

/// The innermost step of the chain: actually running the handlers.
pub type Terminal = Arc<
    dyn Fn(Arc<Envelope>, Arc<HandlerContext>) -> BoxFuture<'static, anyhow::Result<()>>
        + Send
        + Sync,
>;

/// Continuation for the rest of the chain.
pub struct Next {
    chain: Arc<[Arc<dyn Middleware>]>,
    pos: usize,
    terminal: Terminal,
}

impl Next {
    /// Run the remaining middleware and the handlers.
    pub fn run(
        self,
        envelope: Arc<Envelope>,
        ctx: Arc<HandlerContext>,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        match self.chain.get(self.pos).cloned() {
            Some(middleware) => {
                let rest = Next {
                    chain: self.chain.clone(),
                    pos: self.pos + 1,
                    terminal: self.terminal.clone(),
                };
                Box::pin(async move { middleware.handle(envelope, ctx, rest).await })
            }
            None => (self.terminal)(envelope, ctx),
        }
    }
}

/// A cross-cutting layer around handler execution.
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &'static str;

    /// Wrap the rest of the chain. Call `next.run(...)` exactly once unless
    /// short-circuiting.
    async fn handle(
        &self,
        envelope: Arc<Envelope>,
        ctx: Arc<HandlerContext>,
        next: Next,
    ) -> anyhow::Result<()>;
}

/// An ordered middleware chain.
#[derive(Clone)]
pub struct MiddlewareStack {
    chain: Arc<[Arc<dyn Middleware>]>,
}

impl MiddlewareStack {
    /// Build a stack; index 0 is outermost.
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self {
            chain: middlewares.into(),
        }
    }

    /// Run the chain down to `terminal`.
    pub async fn run(
        &self,
        envelope: Arc<Envelope>,
        ctx: Arc<HandlerContext>,
        terminal: Terminal,
    ) -> anyhow::Result<()> {
        Next {
            chain: self.chain.clone(),
            pos: 0,
            terminal,
        }
        .run(envelope, ctx)
        .await
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    /// Whether the stack has no layers.
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }
}

/// Converts everything escaping the inner chain into a [`HandlerError`].
///
/// Already-typed handler errors pass through; foreign errors are classified
/// by the transient-failure pattern set; panics become non-retryable.
#[derive(Debug, Default)]
pub struct ErrorHandlingMiddleware;

#[async_trait::async_trait]
impl Middleware for ErrorHandlingMiddleware {
    fn name(&self) -> &'static str {
        "error_handling"
    }

    async fn handle(
        &self,
        envelope: Arc<Envelope>,
        ctx: Arc<HandlerContext>,
        next: Next,
    ) -> anyhow::Result<()> {
        match AssertUnwindSafe(next.run(envelope, ctx)).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(anyhow::Error::new(HandlerError::from_boundary(&err))),
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                Err(anyhow::Error::new(
                    HandlerError::permanent(detail).with_class("PanicError"),
                ))
            }
        }
    }
}

/// Structural pre-handler check of the wrapped message.
#[derive(Debug, Default)]
pub struct ValidationMiddleware;

#[async_trait::async_trait]
impl Middleware for ValidationMiddleware {
    fn name(&self) -> &'static str {
        "validation"
    }

    async fn handle(
        &self,
        envelope: Arc<Envelope>,
        ctx: Arc<HandlerContext>,
        next: Next,
    ) -> anyhow::Result<()> {
        if let Err(e) = validate_message(&envelope.message) {
            return Err(anyhow::Error::new(
                HandlerError::permanent(e.to_string()).with_class("ValidationError"),
            ));
        }
        next.run(envelope, ctx).await
    }
}

/// Records one attempt metric per execution, success or failure.
pub struct PerformanceMiddleware {
    metrics: Arc<MetricsCollector>,
    clock: Arc<dyn Clock>,
}

impl PerformanceMiddleware {
    /// Layer recording into `metrics`.
    pub fn new(metrics: Arc<MetricsCollector>, clock: Arc<dyn Clock>) -> Self {
        Self { metrics, clock }
    }
}

#[async_trait::async_trait]
impl Middleware for PerformanceMiddleware {
    fn name(&self) -> &'static str {
        "performance"
    }

    async fn handle(
        &self,
        envelope: Arc<Envelope>,
        ctx: Arc<HandlerContext>,
        next: Next,
    ) -> anyhow::Result<()> {
        let started = Instant::now();
        let result = next.run(envelope.clone(), ctx.clone()).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (error, error_class) = match &result {
            Ok(()) => (None, None),
            Err(err) => {
                let handler_error = HandlerError::from_boundary(err);
                (Some(handler_error.message), Some(handler_error.class))
            }
        };

        self.metrics.record(AttemptRecord {
            message_id: envelope.id,
            message_type: envelope.message.message_type.clone(),
            transport: envelope.transport_name.clone(),
            queue: envelope.queue_name.clone(),
            duration_ms,
            success: result.is_ok(),
            error,
            error_class,
            retry_count: ctx.retry_count,
            timestamp: self.clock.now(),
        });

        result
    }
}

/// Emits structured start / complete / error events.
#[derive(Debug, Default)]
pub struct LoggingMiddleware;

#[async_trait::async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn handle(
        &self,
        envelope: Arc<Envelope>,
        ctx: Arc<HandlerContext>,
        next: Next,
    ) -> anyhow::Result<()> {
        debug!(
            message_id = %envelope.id,
            message_type = %envelope.message.message_type,
            queue = %envelope.queue_name,
            retry_count = ctx.retry_count,
            "handling message"
        );

        let started = Instant::now();
        match next.run(envelope.clone(), ctx).await {
            Ok(()) => {
                info!(
                    message_id = %envelope.id,
                    message_type = %envelope.message.message_type,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "message handled"
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    message_id = %envelope.id,
                    message_type = %envelope.message.message_type,
                    error = %err,
                    "message handling failed"
                );
                Err(err)
            }
        }
    }
}
