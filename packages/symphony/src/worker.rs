//! The consumer side: polling workers and the worker pool.
//!
//! Each worker leases a batch from the transport, processes the envelopes
//! concurrently, and settles them: acknowledge on success, reschedule or
//! dead-letter on failure. A reaper task returns abandoned leases to pending
//! on its own cadence.
//!
//! A pool's workers share an [`InflightTracker`]: every running attempt is
//! registered with its cancellation token, so shutdown can cancel handlers
//! explicitly and the drain path can observe when the pool has gone quiet.
//!
//! ```text
//! Worker loop
//!     │
//!     ├─► transport.receive(batch)            (lease)
//!     ├─► inflight.track(id, cancel)
//!     ├─► executor.execute(envelope)          (middleware + handlers)
//!     ├─► transport.acknowledge               on success
//!     ├─► retry manager → transport.send      (reschedule)
//!     │                 → transport.reject    (dead-letter)
//!     └─► inflight.untrack(id)
//! ```

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::HandlerError;
use crate::executor::Executor;
use crate::message::Envelope;
use crate::notify::{Notification, Notifier, Severity};
use crate::retry::RetryManager;
use crate::transport::Transport;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Envelopes leased per poll.
    pub batch_size: usize,
    /// Idle sleep between empty polls (plus up to 10% jitter).
    pub poll_interval: Duration,
    /// Number of parallel workers. Defaults to available parallelism.
    pub worker_count: usize,
    /// Bound on waiting for in-flight handlers at shutdown.
    pub drain_timeout: Duration,
    /// Cadence of the lease reaper; `None` disables it.
    pub reap_interval: Option<Duration>,
    /// Cadence of lease-extension heartbeats for long handlers; `None`
    /// disables them.
    pub heartbeat_interval: Option<Duration>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_secs(1),
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            drain_timeout: Duration::from_secs(30),
            reap_interval: Some(Duration::from_secs(60)),
            heartbeat_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// Attempts currently being processed, shared across a pool's workers.
///
/// Maps envelope id to the attempt's cancellation token. Mutated
/// concurrently by every worker; reads (drain wait, depth probes) never
/// block the appenders.
#[derive(Default)]
pub struct InflightTracker {
    entries: DashMap<Uuid, CancellationToken>,
}

impl InflightTracker {
    /// An empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attempts currently running.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no attempt is running.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the given envelope is currently being processed.
    pub fn contains(&self, message_id: Uuid) -> bool {
        self.entries.contains_key(&message_id)
    }

    /// Cancel every tracked attempt.
    pub fn cancel_all(&self) {
        for entry in self.entries.iter() {
            entry.value().cancel();
        }
    }

    fn track(&self, message_id: Uuid, cancel: CancellationToken) {
        self.entries.insert(message_id, cancel);
    }

    fn untrack(&self, message_id: Uuid) {
        self.entries.remove(&message_id);
    }
}

/// One polling consumer.
pub struct Worker {
    id: String,
    transport: Arc<dyn Transport>,
    executor: Arc<Executor>,
    retry_manager: Arc<RetryManager>,
    notifier: Option<Arc<Notifier>>,
    clock: Arc<dyn Clock>,
    inflight: Arc<InflightTracker>,
    options: WorkerOptions,
}

impl Worker {
    /// A worker with a generated id and its own in-flight tracker.
    pub fn new(
        transport: Arc<dyn Transport>,
        executor: Arc<Executor>,
        retry_manager: Arc<RetryManager>,
        notifier: Option<Arc<Notifier>>,
        clock: Arc<dyn Clock>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            id: format!("worker-{}", Uuid::new_v4()),
            transport,
            executor,
            retry_manager,
            notifier,
            clock,
            inflight: Arc::new(InflightTracker::new()),
            options,
        }
    }

    /// Share an in-flight tracker with other workers (the pool does this).
    pub fn with_inflight(mut self, inflight: Arc<InflightTracker>) -> Self {
        self.inflight = inflight;
        self
    }

    /// This worker's lease identity.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The in-flight tracker this worker registers attempts with.
    pub fn inflight(&self) -> &Arc<InflightTracker> {
        &self.inflight
    }

    /// Lease and process one batch. Returns the batch size. Public so tests
    /// and embedders can drive the loop deterministically.
    pub async fn poll_once(&self, shutdown: &CancellationToken) -> Result<usize, crate::MessengerError> {
        let batch = self
            .transport
            .receive(self.options.batch_size, &self.id)
            .await?;
        let count = batch.len();
        if count > 0 {
            debug!(worker_id = %self.id, count, "leased batch");
            join_all(batch.into_iter().map(|env| self.process(env, shutdown))).await;
        }
        Ok(count)
    }

    /// Run until cancelled, then drain.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            worker_id = %self.id,
            transport = self.transport.name(),
            batch_size = self.options.batch_size,
            "worker starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.poll_once(&shutdown).await {
                Ok(0) => {
                    let jitter = 1.0 + fastrand::f64() * 0.1;
                    let sleep_for = self.options.poll_interval.mul_f64(jitter);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(sleep_for) => {}
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    error!(worker_id = %self.id, error = %err, "poll failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.id, "worker stopped");
    }

    async fn process(&self, envelope: Envelope, shutdown: &CancellationToken) {
        let message_id = envelope.id;
        let cancel = shutdown.child_token();
        self.inflight.track(message_id, cancel.clone());

        let heartbeat = self.spawn_heartbeat(&envelope, cancel.clone());

        let result = self.executor.execute(&envelope, cancel.clone()).await;

        if let Some(handle) = heartbeat {
            cancel.cancel();
            let _ = handle.await;
        }

        if result.success {
            if let Err(err) = self.transport.acknowledge(&envelope).await {
                error!(
                    worker_id = %self.id,
                    message_id = %envelope.id,
                    error = %err,
                    "acknowledge failed; the lease will expire and the handler must be idempotent"
                );
            }
        } else {
            let failure = result
                .error
                .unwrap_or_else(|| HandlerError::permanent("handler failed"));
            self.settle_failure(envelope, failure).await;
        }

        self.inflight.untrack(message_id);
    }

    async fn settle_failure(&self, envelope: Envelope, failure: HandlerError) {
        let decision = self.retry_manager.determine(&envelope, &failure);

        if decision.should_retry {
            let mut rescheduled = envelope.clone();
            rescheduled.delivery.retry_count = decision.new_retry_count;
            rescheduled.delivery.last_error = Some(failure.message.clone());
            rescheduled.delivery.error_class = Some(failure.class.clone());
            if let Some(at) = decision.next_available_at {
                rescheduled.available_at = at;
            }

            warn!(
                worker_id = %self.id,
                message_id = %envelope.id,
                retry_count = decision.new_retry_count,
                delay_ms = decision.delay.as_millis() as u64,
                error = %failure,
                "attempt failed, rescheduling"
            );

            if let Err(err) = self.transport.send(rescheduled).await {
                error!(
                    worker_id = %self.id,
                    message_id = %envelope.id,
                    error = %err,
                    "reschedule failed; the lease will expire and the reaper recovers the envelope"
                );
            }
            self.emit_notification(&envelope, &failure, decision.new_retry_count, false);
        } else {
            let mut dead = envelope.clone();
            dead.delivery.retry_count = decision.new_retry_count;
            warn!(
                worker_id = %self.id,
                message_id = %envelope.id,
                retry_count = decision.new_retry_count,
                error = %failure,
                "moving envelope to the dead letter state"
            );
            if let Err(err) = self.transport.reject(&dead, &failure).await {
                error!(
                    worker_id = %self.id,
                    message_id = %envelope.id,
                    error = %err,
                    "reject failed"
                );
            }
            self.emit_notification(&envelope, &failure, decision.new_retry_count, true);
        }
    }

    fn emit_notification(
        &self,
        envelope: &Envelope,
        failure: &HandlerError,
        retry_count: u32,
        dead_letter: bool,
    ) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(Notification {
                severity: Severity::derive(failure, retry_count, dead_letter),
                message_id: envelope.id,
                message_type: envelope.message.message_type.clone(),
                error: failure.message.clone(),
                error_class: failure.class.clone(),
                retry_count,
                dead_letter,
                timestamp: self.clock.now(),
            });
        }
    }

    fn spawn_heartbeat(
        &self,
        envelope: &Envelope,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let interval = self.options.heartbeat_interval?;
        let transport = self.transport.clone();
        let envelope = envelope.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = transport.extend_lease(&envelope).await {
                            warn!(message_id = %envelope.id, error = %err, "heartbeat failed");
                        }
                    }
                }
            }
        }))
    }
}

/// A running set of workers plus the lease reaper.
pub struct WorkerPool {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    inflight: Arc<InflightTracker>,
    drain_timeout: Duration,
}

impl WorkerPool {
    /// Spawn `options.worker_count` workers (and the reaper, when enabled)
    /// against one transport. All workers share one in-flight tracker.
    pub fn start(
        transport: Arc<dyn Transport>,
        executor: Arc<Executor>,
        retry_manager: Arc<RetryManager>,
        notifier: Option<Arc<Notifier>>,
        clock: Arc<dyn Clock>,
        options: WorkerOptions,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let inflight = Arc::new(InflightTracker::new());
        let mut handles = Vec::with_capacity(options.worker_count + 1);

        for _ in 0..options.worker_count.max(1) {
            let worker = Arc::new(
                Worker::new(
                    transport.clone(),
                    executor.clone(),
                    retry_manager.clone(),
                    notifier.clone(),
                    clock.clone(),
                    options.clone(),
                )
                .with_inflight(inflight.clone()),
            );
            handles.push(tokio::spawn(worker.run(shutdown.clone())));
        }

        if let Some(reap_interval) = options.reap_interval {
            let transport = transport.clone();
            let reaper_shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = reaper_shutdown.cancelled() => break,
                        _ = tokio::time::sleep(reap_interval) => {
                            match transport.reclaim_expired_leases().await {
                                Ok(0) => {}
                                Ok(count) => info!(count, "reclaimed expired leases"),
                                Err(err) => warn!(error = %err, "lease reclaim failed"),
                            }
                        }
                    }
                }
            }));
        }

        Self {
            shutdown,
            handles,
            inflight,
            drain_timeout: options.drain_timeout,
        }
    }

    /// Number of attempts currently running across the pool.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Cancel all workers and wait (bounded) for in-flight handlers to
    /// settle. Attempts still running past the timeout keep their leases
    /// until the reaper reclaims them.
    pub async fn stop(self) {
        self.shutdown.cancel();
        self.inflight.cancel_all();

        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        while !self.inflight.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let remaining = self.inflight.len();
        if remaining > 0 {
            warn!(
                count = remaining,
                "handlers still in flight at drain timeout; their leases will expire"
            );
        }

        for handle in self.handles {
            if tokio::time::timeout(self.drain_timeout, handle)
                .await
                .is_err()
            {
                warn!("worker did not drain within the timeout");
            }
        }
    }

    /// Trigger shutdown without waiting.
    pub fn cancel(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{MessengerConfig, RetryPolicy, RuntimeConfigManager};
    use crate::handler::{FnHandler, HandlerContext, HandlerRegistry};
    use crate::message::{DeliveryInfo, EnvelopeState, Message};
    use crate::middleware::{ErrorHandlingMiddleware, MiddlewareStack};
    use crate::transport::{DurableTransport, InMemoryMessageStore, MessageStore};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Fixture {
        worker: Worker,
        store: Arc<InMemoryMessageStore>,
        transport: Arc<DurableTransport>,
        clock: Arc<ManualClock>,
        registry: Arc<HandlerRegistry>,
        executor: Arc<Executor>,
        retry_manager: Arc<RetryManager>,
    }

    fn fixture(retry: RetryPolicy) -> Fixture {
        let mut config = MessengerConfig::default();
        config.retry.insert("default".to_string(), retry);
        let config = Arc::new(RuntimeConfigManager::new(config).unwrap());

        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(InMemoryMessageStore::new());
        let transport = Arc::new(DurableTransport::new(
            "durable",
            store.clone(),
            clock.clone(),
        ));
        let registry = Arc::new(HandlerRegistry::new());
        let executor = Arc::new(Executor::new(
            registry.clone(),
            MiddlewareStack::new(vec![Arc::new(ErrorHandlingMiddleware)]),
        ));
        let retry_manager = Arc::new(RetryManager::new(config, clock.clone()));

        let worker = Worker::new(
            transport.clone(),
            executor.clone(),
            retry_manager.clone(),
            None,
            clock.clone(),
            WorkerOptions {
                heartbeat_interval: None,
                ..Default::default()
            },
        );
        Fixture {
            worker,
            store,
            transport,
            clock,
            registry,
            executor,
            retry_manager,
        }
    }

    fn envelope(clock: &ManualClock, max_retries: u32) -> Envelope {
        let now = clock.now();
        Envelope {
            id: Uuid::new_v4(),
            message: Message::new("Work", json!({ "k": "a" })),
            transport_name: "durable".to_string(),
            queue_name: "default".to_string(),
            priority: 5,
            idempotency_key: None,
            scheduled_at: None,
            available_at: now,
            created_at: now,
            delivery: DeliveryInfo::new(max_retries),
        }
    }

    #[tokio::test]
    async fn successful_attempt_acknowledges() {
        let f = fixture(RetryPolicy::default());
        f.registry
            .register(Arc::new(FnHandler::new("Work", |_m, _c| async { Ok(()) })))
            .unwrap();

        let env = envelope(&f.clock, 3);
        f.transport.send(env.clone()).await.unwrap();

        let processed = f.worker.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(processed, 1);

        let row = f.store.get(env.id).await.unwrap().unwrap();
        assert_eq!(row.state, EnvelopeState::Acked);
    }

    #[tokio::test]
    async fn retryable_failure_reschedules_with_backoff() {
        let f = fixture(RetryPolicy {
            max_retries: 3,
            delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 1_000,
        });
        f.registry
            .register(Arc::new(FnHandler::new("Work", |_m, _c| async {
                Err(anyhow::anyhow!("connection reset"))
            })))
            .unwrap();

        let env = envelope(&f.clock, 3);
        f.transport.send(env.clone()).await.unwrap();
        let t0 = f.clock.now();

        f.worker.poll_once(&CancellationToken::new()).await.unwrap();

        let row = f.store.get(env.id).await.unwrap().unwrap();
        assert_eq!(row.state, EnvelopeState::Pending);
        assert_eq!(row.retry_count, 1);
        assert_eq!(row.last_error.as_deref(), Some("connection reset"));

        let delay_ms = (row.available_at - t0).num_milliseconds();
        assert!(
            (90..=110).contains(&delay_ms),
            "first retry delay {delay_ms}ms outside the jitter band"
        );
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_with_final_error() {
        let f = fixture(RetryPolicy {
            max_retries: 3,
            delay_ms: 10,
            multiplier: 2.0,
            max_delay_ms: 100,
        });
        f.registry
            .register(Arc::new(FnHandler::new("Work", |_m, _c| async {
                Err(anyhow::anyhow!("connection reset"))
            })))
            .unwrap();

        let env = envelope(&f.clock, 3);
        f.transport.send(env.clone()).await.unwrap();

        // Attempts 1 and 2 reschedule; attempt 3 exhausts the budget and
        // dead-letters. The extra poll confirms dead rows are never leased.
        for _ in 0..4 {
            f.clock.advance(chrono::Duration::seconds(1));
            f.worker.poll_once(&CancellationToken::new()).await.unwrap();
        }

        let row = f.store.get(env.id).await.unwrap().unwrap();
        assert_eq!(row.state, EnvelopeState::Dead);
        assert_eq!(row.retry_count, 3);
        assert_eq!(row.last_error.as_deref(), Some("connection reset"));
    }

    #[tokio::test]
    async fn non_retryable_failure_dead_letters_without_retry() {
        let f = fixture(RetryPolicy::default());
        f.registry
            .register(Arc::new(FnHandler::new("Work", |_m, _c| async {
                Err(anyhow::Error::new(crate::HandlerError::permanent("bad record")))
            })))
            .unwrap();

        let env = envelope(&f.clock, 3);
        f.transport.send(env.clone()).await.unwrap();
        f.worker.poll_once(&CancellationToken::new()).await.unwrap();

        let row = f.store.get(env.id).await.unwrap().unwrap();
        assert_eq!(row.state, EnvelopeState::Dead);
        assert_eq!(row.retry_count, 0);
        assert_eq!(row.last_error.as_deref(), Some("bad record"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inflight_tracker_observes_running_attempts() {
        let f = fixture(RetryPolicy::default());
        let gate = Arc::new(tokio::sync::Notify::new());
        let gate_in_handler = gate.clone();
        f.registry
            .register(Arc::new(FnHandler::new("Work", move |_m, _c| {
                let gate = gate_in_handler.clone();
                async move {
                    gate.notified().await;
                    Ok(())
                }
            })))
            .unwrap();

        let env = envelope(&f.clock, 3);
        f.transport.send(env.clone()).await.unwrap();

        let worker = Arc::new(f.worker);
        let inflight = worker.inflight().clone();
        assert!(inflight.is_empty());

        let poll_worker = worker.clone();
        let poll = tokio::spawn(async move {
            poll_worker.poll_once(&CancellationToken::new()).await.unwrap()
        });

        for _ in 0..100 {
            if inflight.contains(env.id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(inflight.contains(env.id));
        assert_eq!(inflight.len(), 1);

        gate.notify_one();
        assert_eq!(poll.await.unwrap(), 1);
        assert!(inflight.is_empty());

        let row = f.store.get(env.id).await.unwrap().unwrap();
        assert_eq!(row.state, EnvelopeState::Acked);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_cancels_in_flight_handlers() {
        let f = fixture(RetryPolicy::default());
        f.registry
            .register(Arc::new(FnHandler::new(
                "Work",
                |_m, ctx: HandlerContext| async move {
                    ctx.cancellation.cancelled().await;
                    Err(anyhow::anyhow!("connection lost during shutdown"))
                },
            )))
            .unwrap();

        let env = envelope(&f.clock, 3);
        f.transport.send(env.clone()).await.unwrap();

        let pool = WorkerPool::start(
            f.transport.clone(),
            f.executor.clone(),
            f.retry_manager.clone(),
            None,
            f.clock.clone(),
            WorkerOptions {
                worker_count: 1,
                poll_interval: Duration::from_millis(10),
                reap_interval: None,
                heartbeat_interval: None,
                ..Default::default()
            },
        );

        for _ in 0..100 {
            if pool.in_flight() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(pool.in_flight(), 1);

        pool.stop().await;

        // The cancelled attempt classified as retryable and was rescheduled
        // for a later worker generation.
        let row = f.store.get(env.id).await.unwrap().unwrap();
        assert_eq!(row.state, EnvelopeState::Pending);
        assert_eq!(row.retry_count, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pool_processes_and_drains_on_stop() {
        let f = fixture(RetryPolicy::default());
        let handled = Arc::new(AtomicU32::new(0));
        let handled_in_handler = handled.clone();
        f.registry
            .register(Arc::new(FnHandler::new("Work", move |_m, _c| {
                let handled = handled_in_handler.clone();
                async move {
                    handled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })))
            .unwrap();

        let env = envelope(&f.clock, 3);
        f.transport.send(env.clone()).await.unwrap();

        let pool = WorkerPool::start(
            f.transport.clone(),
            f.executor.clone(),
            f.retry_manager.clone(),
            None,
            f.clock.clone(),
            WorkerOptions {
                worker_count: 2,
                poll_interval: Duration::from_millis(10),
                reap_interval: None,
                heartbeat_interval: None,
                ..Default::default()
            },
        );

        for _ in 0..100 {
            if handled.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        pool.stop().await;

        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }
}
