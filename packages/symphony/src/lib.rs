//! # Symphony
//!
//! A durable asynchronous message bus: dispatch, routing, retry with
//! exponential backoff, dead-lettering, persistent schedules (once, cron,
//! interval), handler middleware, metrics and health.
//!
//! ## Architecture
//!
//! ```text
//! Caller
//!     │ dispatch(message, options)
//!     ▼
//! Dispatcher ── Validator ── Router
//!     │
//!     ▼ send()
//! Transport (sync: run inline │ durable: persist via MessageStore)
//!     │
//!     ▼ receive()  (lease, priority DESC / available_at ASC)
//! Worker pool
//!     │
//!     ▼
//! Middleware stack ─► Handlers
//!     │
//!     ├─ success ─► acknowledge
//!     └─ failure ─► RetryManager ─► reschedule (backoff + jitter)
//!                                └► reject (dead letter)
//!
//! Scheduler ──► due rows ──► dispatch (routing/retry apply normally)
//! ```
//!
//! ## Guarantees
//!
//! - **At-least-once delivery** with idempotency-key deduplication: two live
//!   envelopes never share `(message type, idempotency key)`.
//! - **Exclusive leases**: a leased envelope is invisible to other workers
//!   until its lease expires; abandoned leases are reaped back to pending.
//! - **Terminal states are write-once**: acknowledged and dead-lettered
//!   envelopes never return to the queue (dead ones only via the explicit
//!   operator redispatch).
//! - **No global ordering**: priority is preferred, not guaranteed; equal
//!   priorities drain in `available_at` order.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use symphony::{
//!     DispatchOptions, FnHandler, Message, Messenger, WorkerOptions,
//! };
//!
//! let messenger = Messenger::builder()
//!     .config(config)                     // transports, routing, retry
//!     .message_store(store)               // e.g. symphony_postgres::PostgresMessageStore
//!     .build()?;
//!
//! messenger.register_handler(Arc::new(FnHandler::new(
//!     "EmailRequested",
//!     |message: Message, _ctx| async move {
//!         // deliver the email…
//!         Ok(())
//!     },
//! )))?;
//!
//! let receipt = messenger
//!     .dispatch(Message::new("EmailRequested", payload), DispatchOptions::default())
//!     .await?;
//!
//! messenger.start_workers("durable", WorkerOptions::default()).await?;
//! ```

mod clock;
mod config;
mod cron;
mod dispatcher;
mod error;
mod executor;
mod handler;
mod health;
mod message;
mod messenger;
mod metrics;
mod middleware;
mod notify;
mod retry;
mod routing;
mod scheduler;
pub mod transport;
mod validate;
mod worker;

pub use clock::{Clock, IdGenerator, ManualClock, SystemClock, UuidGenerator};
pub use config::{
    FeatureFlags, MessengerConfig, PriorityRouting, RetryPolicy, RuntimeConfigManager,
    TransportConfig, TransportKind, UpdateListener,
};
pub use cron::{CronExpr, CronField};
pub use dispatcher::{DispatchOptions, DispatchReceipt, Dispatcher, TransportRegistry};
pub use error::{is_retryable_message, HandlerError, MessengerError, RETRYABLE_PATTERNS};
pub use executor::{ExecutionResult, Executor};
pub use handler::{FnHandler, Handler, HandlerContext, HandlerRegistry};
pub use health::{HealthCheck, HealthMonitor, HealthSnapshot, HealthStatus};
pub use message::{
    deserialize_envelope, deserialize_message, new_idempotency_key, new_message_id,
    serialize_envelope, serialize_message, DeliveryInfo, Envelope, EnvelopeState, Message,
};
pub use messenger::{Messenger, MessengerBuilder};
pub use metrics::{AggregatedMetrics, AttemptRecord, BucketStats, MetricsCollector};
pub use middleware::{
    ErrorHandlingMiddleware, LoggingMiddleware, Middleware, MiddlewareStack, Next,
    PerformanceMiddleware, Terminal, ValidationMiddleware,
};
pub use notify::{
    LogChannel, Notification, NotificationChannel, Notifier, Severity, SlackChannel,
    WebhookChannel,
};
pub use retry::{RetryDecision, RetryManager, RetryStrategy};
pub use routing::Router;
pub use scheduler::{ScheduleOptions, ScheduleSpec, Scheduler, SchedulerOptions};
pub use transport::{
    DurableTransport, InMemoryMessageStore, InMemoryScheduleStore, InsertOutcome, MessageRow,
    MessageStore, ScheduleRow, ScheduleStore, ScheduleType, SendReceipt, StoreError,
    SyncTransport, Transport,
};
pub use worker::{InflightTracker, Worker, WorkerOptions, WorkerPool};

// Re-export commonly used external types.
pub use async_trait::async_trait;
