//! The messenger facade.
//!
//! One [`Messenger`] owns what the process needs: the config manager, the
//! handler registry, transport instances, dispatcher, retry manager,
//! scheduler, metrics, health and notifier. Construct it with
//! [`Messenger::builder`] at startup and share it (`Arc`) across the
//! application edge.
//!
//! Building and running require a tokio runtime: the notifier drain task is
//! spawned at build time, workers and the scheduler at start time.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::clock::{Clock, IdGenerator, SystemClock, UuidGenerator};
use crate::config::{FeatureFlags, MessengerConfig, RuntimeConfigManager, TransportKind};
use crate::dispatcher::{DispatchOptions, DispatchReceipt, Dispatcher, TransportRegistry};
use crate::error::MessengerError;
use crate::executor::Executor;
use crate::handler::{Handler, HandlerRegistry};
use crate::health::{HealthMonitor, HealthSnapshot};
use crate::message::Message;
use crate::metrics::{AggregatedMetrics, MetricsCollector, DEFAULT_METRICS_CAPACITY};
use crate::middleware::{
    ErrorHandlingMiddleware, LoggingMiddleware, Middleware, MiddlewareStack,
    PerformanceMiddleware, ValidationMiddleware,
};
use crate::notify::{LogChannel, NotificationChannel, Notifier, Severity};
use crate::retry::RetryManager;
use crate::scheduler::{ScheduleOptions, ScheduleSpec, Scheduler, SchedulerOptions};
use crate::transport::{
    DurableTransport, MessageStore, ScheduleStore, SyncTransport, Transport,
};
use crate::worker::{WorkerOptions, WorkerPool};

/// Configures and constructs a [`Messenger`].
pub struct MessengerBuilder {
    config: MessengerConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    message_store: Option<Arc<dyn MessageStore>>,
    schedule_store: Option<Arc<dyn ScheduleStore>>,
    channels: Vec<Arc<dyn NotificationChannel>>,
    notify_threshold: Severity,
    flags: Option<FeatureFlags>,
    metrics_capacity: usize,
    validation: bool,
    performance: bool,
    logging: bool,
    extra_middleware: Vec<Arc<dyn Middleware>>,
    scheduler_options: SchedulerOptions,
}

impl MessengerBuilder {
    fn new() -> Self {
        Self {
            config: MessengerConfig::default(),
            clock: Arc::new(SystemClock),
            ids: Arc::new(UuidGenerator),
            message_store: None,
            schedule_store: None,
            channels: Vec::new(),
            notify_threshold: Severity::Warning,
            flags: None,
            metrics_capacity: DEFAULT_METRICS_CAPACITY,
            validation: true,
            performance: true,
            logging: true,
            extra_middleware: Vec::new(),
            scheduler_options: SchedulerOptions::default(),
        }
    }

    /// Use this configuration snapshot.
    pub fn config(mut self, config: MessengerConfig) -> Self {
        self.config = config;
        self
    }

    /// Inject a clock (tests, simulations).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Inject an id generator.
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Persistence driver for durable transports.
    pub fn message_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.message_store = Some(store);
        self
    }

    /// Persistence driver for schedules.
    pub fn schedule_store(mut self, store: Arc<dyn ScheduleStore>) -> Self {
        self.schedule_store = Some(store);
        self
    }

    /// Add a notification channel. Without any, failures log only.
    pub fn notification_channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    /// Minimum severity that reaches the channels.
    pub fn notify_threshold(mut self, threshold: Severity) -> Self {
        self.notify_threshold = threshold;
        self
    }

    /// Override environment feature flags (tests).
    pub fn feature_flags(mut self, flags: FeatureFlags) -> Self {
        self.flags = Some(flags);
        self
    }

    /// Metrics ring capacity.
    pub fn metrics_capacity(mut self, capacity: usize) -> Self {
        self.metrics_capacity = capacity;
        self
    }

    /// Toggle the validation middleware.
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.validation = enabled;
        self
    }

    /// Toggle the performance middleware.
    pub fn with_performance(mut self, enabled: bool) -> Self {
        self.performance = enabled;
        self
    }

    /// Toggle the logging middleware.
    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.logging = enabled;
        self
    }

    /// Append a custom middleware inside the default stack (runs closest to
    /// the handlers).
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.extra_middleware.push(middleware);
        self
    }

    /// Scheduler poll configuration.
    pub fn scheduler_options(mut self, options: SchedulerOptions) -> Self {
        self.scheduler_options = options;
        self
    }

    /// Validate the configuration and wire everything together.
    pub fn build(self) -> Result<Messenger, MessengerError> {
        let config = Arc::new(RuntimeConfigManager::new(self.config)?);
        let registry = Arc::new(HandlerRegistry::new());
        let metrics = Arc::new(MetricsCollector::new(self.metrics_capacity));

        let mut stack: Vec<Arc<dyn Middleware>> = vec![Arc::new(ErrorHandlingMiddleware)];
        if self.validation {
            stack.push(Arc::new(ValidationMiddleware));
        }
        if self.performance {
            stack.push(Arc::new(PerformanceMiddleware::new(
                metrics.clone(),
                self.clock.clone(),
            )));
        }
        if self.logging {
            stack.push(Arc::new(LoggingMiddleware));
        }
        stack.extend(self.extra_middleware);

        let executor = Arc::new(Executor::new(
            registry.clone(),
            MiddlewareStack::new(stack),
        ));

        let transports = Arc::new(TransportRegistry::new());
        for (name, transport_config) in &config.snapshot().transports {
            let instance: Arc<dyn Transport> = match transport_config.kind {
                TransportKind::Sync => {
                    Arc::new(SyncTransport::new(name.as_str(), executor.clone()))
                }
                TransportKind::Durable => {
                    let store = self.message_store.clone().ok_or_else(|| {
                        MessengerError::Configuration(format!(
                            "transport {name:?} is durable but no message store was provided"
                        ))
                    })?;
                    let mut durable =
                        DurableTransport::new(name.as_str(), store, self.clock.clone());
                    if let Some(lock_ms) = transport_config.lock_duration_ms {
                        durable = durable.with_lock_duration(Duration::from_millis(lock_ms));
                    }
                    Arc::new(durable)
                }
            };
            transports.insert(name.clone(), instance);
        }

        let dispatcher = Arc::new(Dispatcher::new(
            config.clone(),
            transports.clone(),
            self.clock.clone(),
            self.ids,
        ));
        let retry_manager = Arc::new(RetryManager::new(config.clone(), self.clock.clone()));

        let channels = if self.channels.is_empty() {
            vec![Arc::new(LogChannel) as Arc<dyn NotificationChannel>]
        } else {
            self.channels
        };
        let notifier = Notifier::start(channels, self.notify_threshold);

        let scheduler = self.schedule_store.map(|store| {
            Arc::new(Scheduler::new(
                store,
                dispatcher.clone(),
                self.clock.clone(),
                self.scheduler_options,
            ))
        });

        let health = HealthMonitor::new(
            transports.clone(),
            metrics.clone(),
            self.clock.clone(),
            chrono::Duration::minutes(5),
        );

        Ok(Messenger {
            config,
            registry,
            transports,
            dispatcher,
            executor,
            retry_manager,
            scheduler,
            message_store: self.message_store,
            metrics,
            health,
            notifier,
            clock: self.clock,
            flags: self.flags.unwrap_or_else(FeatureFlags::from_env),
            workers: tokio::sync::Mutex::new(None),
            scheduler_task: tokio::sync::Mutex::new(None),
        })
    }
}

/// The messenger: dispatch, scheduling, workers, observability.
pub struct Messenger {
    config: Arc<RuntimeConfigManager>,
    registry: Arc<HandlerRegistry>,
    transports: Arc<TransportRegistry>,
    dispatcher: Arc<Dispatcher>,
    executor: Arc<Executor>,
    retry_manager: Arc<RetryManager>,
    scheduler: Option<Arc<Scheduler>>,
    message_store: Option<Arc<dyn MessageStore>>,
    metrics: Arc<MetricsCollector>,
    health: HealthMonitor,
    notifier: Arc<Notifier>,
    clock: Arc<dyn Clock>,
    flags: FeatureFlags,
    workers: tokio::sync::Mutex<Option<WorkerPool>>,
    scheduler_task: tokio::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Messenger {
    /// Start configuring a messenger.
    pub fn builder() -> MessengerBuilder {
        MessengerBuilder::new()
    }

    /// The live config manager, for runtime updates.
    pub fn config(&self) -> &Arc<RuntimeConfigManager> {
        &self.config
    }

    /// The feature flags this instance was built with.
    pub fn flags(&self) -> FeatureFlags {
        self.flags
    }

    /// Register a handler for its message type.
    pub fn register_handler(&self, handler: Arc<dyn Handler>) -> Result<(), MessengerError> {
        self.registry.register(handler)
    }

    /// Remove handlers for a type (all of them, or one by name).
    pub fn unregister_handler(&self, message_type: &str, name: Option<&str>) -> bool {
        self.registry.unregister(message_type, name)
    }

    /// Dispatch a message. See [`Dispatcher::dispatch`].
    pub async fn dispatch(
        &self,
        message: Message,
        options: DispatchOptions,
    ) -> Result<DispatchReceipt, MessengerError> {
        self.ensure_enabled()?;
        self.dispatcher.dispatch(message, options).await
    }

    /// Create a persistent schedule. Requires a schedule store.
    pub async fn schedule_message(
        &self,
        message: Message,
        spec: ScheduleSpec,
        options: ScheduleOptions,
    ) -> Result<Uuid, MessengerError> {
        self.ensure_enabled()?;
        self.scheduler_ref()?.schedule(message, spec, options).await
    }

    /// Re-enable a schedule.
    pub async fn enable_schedule(&self, id: Uuid) -> Result<bool, MessengerError> {
        self.scheduler_ref()?.enable(id).await
    }

    /// Disable a schedule.
    pub async fn disable_schedule(&self, id: Uuid) -> Result<bool, MessengerError> {
        self.scheduler_ref()?.disable(id).await
    }

    /// Delete a schedule.
    pub async fn delete_schedule(&self, id: Uuid) -> Result<bool, MessengerError> {
        self.scheduler_ref()?.delete(id).await
    }

    /// Start the worker pool against one transport.
    pub async fn start_workers(
        &self,
        transport_name: &str,
        options: WorkerOptions,
    ) -> Result<(), MessengerError> {
        self.ensure_enabled()?;
        let transport = self.transports.get(transport_name).ok_or_else(|| {
            MessengerError::Configuration(format!(
                "transport {transport_name:?} has no installed instance"
            ))
        })?;

        let mut workers = self.workers.lock().await;
        if workers.is_some() {
            return Err(MessengerError::Configuration(
                "workers are already running".to_string(),
            ));
        }

        *workers = Some(WorkerPool::start(
            transport,
            self.executor.clone(),
            self.retry_manager.clone(),
            Some(self.notifier.clone()),
            self.clock.clone(),
            options,
        ));
        info!(transport = transport_name, "workers started");
        Ok(())
    }

    /// Stop the worker pool, draining in-flight handlers (bounded).
    pub async fn stop_workers(&self) {
        let pool = self.workers.lock().await.take();
        if let Some(pool) = pool {
            pool.stop().await;
            info!("workers stopped");
        }
    }

    /// Start the scheduler poll loop. Requires a schedule store.
    pub async fn start_scheduler(&self) -> Result<(), MessengerError> {
        self.ensure_enabled()?;
        let scheduler = self.scheduler_ref()?.clone();

        let mut task = self.scheduler_task.lock().await;
        if task.is_some() {
            return Err(MessengerError::Configuration(
                "scheduler is already running".to_string(),
            ));
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(shutdown.clone()));
        *task = Some((shutdown, handle));
        Ok(())
    }

    /// Stop the scheduler poll loop.
    pub async fn stop_scheduler(&self) {
        let task = self.scheduler_task.lock().await.take();
        if let Some((shutdown, handle)) = task {
            shutdown.cancel();
            let _ = handle.await;
        }
    }

    /// Evaluate health right now.
    pub async fn health(&self) -> HealthSnapshot {
        self.health.evaluate().await
    }

    /// Aggregate metrics over the trailing `window`.
    pub fn metrics(&self, window: chrono::Duration) -> AggregatedMetrics {
        let now = self.clock.now();
        self.metrics.aggregate(now - window, now)
    }

    /// Operator action: return a dead-lettered envelope to pending with a
    /// fresh retry budget. Returns whether a dead row was found.
    pub async fn redispatch_dead(&self, message_id: Uuid) -> Result<bool, MessengerError> {
        let store = self.message_store.as_ref().ok_or_else(|| {
            MessengerError::Configuration("no message store configured".to_string())
        })?;
        store
            .redispatch_dead(message_id, self.clock.now())
            .await
            .map_err(|e| e.into_messenger("durable"))
    }

    fn ensure_enabled(&self) -> Result<(), MessengerError> {
        if !self.flags.enabled {
            return Err(MessengerError::Configuration(
                "messenger is disabled by the master switch".to_string(),
            ));
        }
        Ok(())
    }

    fn scheduler_ref(&self) -> Result<&Arc<Scheduler>, MessengerError> {
        self.scheduler.as_ref().ok_or_else(|| {
            MessengerError::Configuration("no schedule store configured".to_string())
        })
    }
}
