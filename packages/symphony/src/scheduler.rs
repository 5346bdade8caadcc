//! Persistent schedules: once, cron, interval.
//!
//! The scheduler polls its store for due rows, materializes a message from
//! each, dispatches it through the normal pipeline (routing, priority and
//! retry all apply), then recomputes `next_run_at` and persists. One bad row
//! logs and is skipped; the batch continues.
//!
//! Interval schedules recompute `next_run_at = now + interval` at dispatch
//! time, so a scheduler running behind drifts forward rather than firing
//! catch-up runs.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::cron::CronExpr;
use crate::dispatcher::{DispatchOptions, Dispatcher};
use crate::error::MessengerError;
use crate::message::Message;
use crate::transport::{ScheduleRow, ScheduleStore, ScheduleType};
use crate::validate::validate_message;

/// When a schedule fires.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleSpec {
    /// Fire once at a fixed instant. A past instant fires on the first poll.
    Once {
        /// The instant to fire at.
        at: DateTime<Utc>,
    },
    /// Fire per a five-field cron expression, evaluated in the schedule's
    /// timezone.
    Cron {
        /// The cron expression.
        expr: String,
    },
    /// Fire every fixed interval.
    Interval {
        /// The interval; must be positive.
        every: Duration,
    },
}

/// Schedule-wide options.
#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    /// Transport override for dispatched messages.
    pub transport: Option<String>,
    /// IANA timezone for cron evaluation.
    pub timezone: String,
    /// Stop after this many fires.
    pub max_runs: Option<u32>,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            transport: None,
            timezone: "UTC".to_string(),
            max_runs: None,
        }
    }
}

/// Scheduler runtime configuration.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Due rows processed per poll.
    pub batch_size: usize,
    /// Sleep between polls.
    pub poll_interval: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Owns schedule rows and materializes their messages when due.
pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    options: SchedulerOptions,
}

impl Scheduler {
    /// A scheduler over `store`, dispatching through `dispatcher`.
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            store,
            dispatcher,
            clock,
            options,
        }
    }

    /// Validate and persist a schedule. Returns the schedule id.
    pub async fn schedule(
        &self,
        message: Message,
        spec: ScheduleSpec,
        options: ScheduleOptions,
    ) -> Result<Uuid, MessengerError> {
        validate_message(&message)?;
        let tz = parse_timezone(&options.timezone)?;
        let now = self.clock.now();

        let (schedule_type, schedule_config, next_run_at) = match &spec {
            ScheduleSpec::Once { at } => (ScheduleType::Once, json!({ "at": at }), Some(*at)),
            ScheduleSpec::Cron { expr } => {
                let cron = CronExpr::parse(expr)?;
                let next = cron.next_after(now, tz)?;
                (ScheduleType::Cron, json!({ "cron": expr }), Some(next))
            }
            ScheduleSpec::Interval { every } => {
                if every.is_zero() {
                    return Err(MessengerError::Validation(
                        "schedule interval must be positive".to_string(),
                    ));
                }
                let next = now + chrono::Duration::milliseconds(every.as_millis() as i64);
                (
                    ScheduleType::Interval,
                    json!({ "interval_ms": every.as_millis() as u64 }),
                    Some(next),
                )
            }
        };

        let row = ScheduleRow {
            id: Uuid::new_v4(),
            message_type: message.message_type,
            transport: options.transport,
            body: message.payload,
            headers: message
                .metadata
                .map(Value::Object)
                .unwrap_or(Value::Null),
            schedule_type,
            schedule_config,
            timezone: options.timezone,
            next_run_at,
            last_run_at: None,
            run_count: 0,
            max_runs: options.max_runs,
            enabled: true,
            created_at: now,
            updated_at: now,
        };

        let id = self
            .store
            .insert(row)
            .await
            .map_err(|e| MessengerError::Scheduler(e.to_string()))?;
        info!(schedule_id = %id, schedule_type = schedule_type.as_str(), "schedule created");
        Ok(id)
    }

    /// Dispatch every due schedule and recompute its next run. Returns the
    /// number of rows that dispatched.
    pub async fn process_due(&self) -> Result<usize, MessengerError> {
        let now = self.clock.now();
        let due = self
            .store
            .due(now, self.options.batch_size)
            .await
            .map_err(|e| MessengerError::Scheduler(e.to_string()))?;

        let mut dispatched = 0;
        for row in due {
            match self.fire(row, now).await {
                Ok(()) => dispatched += 1,
                // One bad row must not block the rest of the batch.
                Err(err) => error!(error = %err, "schedule row failed, skipping"),
            }
        }
        Ok(dispatched)
    }

    async fn fire(&self, mut row: ScheduleRow, now: DateTime<Utc>) -> Result<(), MessengerError> {
        let metadata = match &row.headers {
            Value::Object(map) if !map.is_empty() => Some(map.clone()),
            _ => None,
        };
        let message = Message {
            message_type: row.message_type.clone(),
            payload: row.body.clone(),
            metadata,
        };
        let options = DispatchOptions {
            transport: row.transport.clone(),
            ..Default::default()
        };

        let receipt = self.dispatcher.dispatch(message, options).await?;
        debug!(
            schedule_id = %row.id,
            message_id = %receipt.message_id,
            "schedule fired"
        );

        row.run_count += 1;
        row.last_run_at = Some(now);
        row.next_run_at = self.next_run(&row, now)?;
        row.updated_at = now;

        let exhausted = row
            .max_runs
            .map_or(false, |max| row.run_count >= max);
        if exhausted || row.next_run_at.is_none() {
            row.enabled = false;
            row.next_run_at = None;
        }

        self.store
            .update(&row)
            .await
            .map_err(|e| MessengerError::Scheduler(e.to_string()))
    }

    /// The next fire time after a run at `now`. `None` for exhausted one-shot
    /// schedules.
    fn next_run(
        &self,
        row: &ScheduleRow,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, MessengerError> {
        match row.schedule_type {
            ScheduleType::Once => Ok(None),
            ScheduleType::Cron => {
                let expr = row
                    .schedule_config
                    .get("cron")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        MessengerError::Scheduler(format!(
                            "schedule {} has no cron expression",
                            row.id
                        ))
                    })?;
                let tz = parse_timezone(&row.timezone)?;
                Ok(Some(CronExpr::parse(expr)?.next_after(now, tz)?))
            }
            ScheduleType::Interval => {
                let interval_ms = row
                    .schedule_config
                    .get("interval_ms")
                    .and_then(Value::as_u64)
                    .filter(|ms| *ms > 0)
                    .ok_or_else(|| {
                        MessengerError::Scheduler(format!(
                            "schedule {} has no positive interval",
                            row.id
                        ))
                    })?;
                // Recomputed from dispatch time: drifts forward when behind.
                Ok(Some(now + chrono::Duration::milliseconds(interval_ms as i64)))
            }
        }
    }

    /// Re-enable a schedule, recomputing `next_run_at` from now.
    pub async fn enable(&self, id: Uuid) -> Result<bool, MessengerError> {
        let Some(mut row) = self
            .store
            .get(id)
            .await
            .map_err(|e| MessengerError::Scheduler(e.to_string()))?
        else {
            return Ok(false);
        };

        let now = self.clock.now();
        row.enabled = true;
        row.next_run_at = match row.schedule_type {
            // A one-shot keeps its original instant; re-enabling a fired one
            // leaves it exhausted.
            ScheduleType::Once => row
                .schedule_config
                .get("at")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok())
                .filter(|_| row.run_count == 0),
            _ => self.next_run(&row, now)?,
        };
        if row.next_run_at.is_none() {
            row.enabled = false;
        }
        row.updated_at = now;

        self.store
            .update(&row)
            .await
            .map_err(|e| MessengerError::Scheduler(e.to_string()))?;
        Ok(true)
    }

    /// Disable a schedule. Returns whether it exists.
    pub async fn disable(&self, id: Uuid) -> Result<bool, MessengerError> {
        self.store
            .set_enabled(id, false)
            .await
            .map_err(|e| MessengerError::Scheduler(e.to_string()))
    }

    /// Delete a schedule. Returns whether it existed.
    pub async fn delete(&self, id: Uuid) -> Result<bool, MessengerError> {
        self.store
            .delete(id)
            .await
            .map_err(|e| MessengerError::Scheduler(e.to_string()))
    }

    /// Poll until cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            batch_size = self.options.batch_size,
            poll_interval_ms = self.options.poll_interval.as_millis() as u64,
            "scheduler starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.options.poll_interval) => {
                    if let Err(err) = self.process_due().await {
                        warn!(error = %err, "schedule poll failed");
                    }
                }
            }
        }

        info!("scheduler stopped");
    }
}

fn parse_timezone(name: &str) -> Result<Tz, MessengerError> {
    Tz::from_str(name)
        .map_err(|_| MessengerError::Validation(format!("unknown timezone {name:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, UuidGenerator};
    use crate::config::{MessengerConfig, RuntimeConfigManager, TransportConfig};
    use crate::dispatcher::TransportRegistry;
    use crate::transport::{DurableTransport, InMemoryMessageStore, InMemoryScheduleStore};

    struct Fixture {
        scheduler: Scheduler,
        schedules: Arc<InMemoryScheduleStore>,
        messages: Arc<InMemoryMessageStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture(start: DateTime<Utc>) -> Fixture {
        let mut config = MessengerConfig::default();
        config
            .transports
            .insert("durable".to_string(), TransportConfig::durable());
        config.default_transport = "durable".to_string();
        let config = Arc::new(RuntimeConfigManager::new(config).unwrap());

        let clock = Arc::new(ManualClock::new(start));
        let messages = Arc::new(InMemoryMessageStore::new());
        let transports = Arc::new(TransportRegistry::new());
        transports.insert(
            "durable",
            Arc::new(DurableTransport::new(
                "durable",
                messages.clone(),
                clock.clone(),
            )),
        );

        let dispatcher = Arc::new(Dispatcher::new(
            config,
            transports,
            clock.clone(),
            Arc::new(UuidGenerator),
        ));
        let schedules = Arc::new(InMemoryScheduleStore::new());
        let scheduler = Scheduler::new(
            schedules.clone(),
            dispatcher,
            clock.clone(),
            SchedulerOptions::default(),
        );
        Fixture {
            scheduler,
            schedules,
            messages,
            clock,
        }
    }

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn cron_schedule_fires_on_the_hour() {
        let f = fixture(utc("2025-01-01T00:30:00Z"));
        let id = f
            .scheduler
            .schedule(
                Message::new("Tick", json!({})),
                ScheduleSpec::Cron {
                    expr: "0 * * * *".to_string(),
                },
                ScheduleOptions::default(),
            )
            .await
            .unwrap();

        let row = f.schedules.get(id).await.unwrap().unwrap();
        assert_eq!(row.next_run_at, Some(utc("2025-01-01T01:00:00Z")));

        // Not yet due.
        assert_eq!(f.scheduler.process_due().await.unwrap(), 0);

        f.clock.set(utc("2025-01-01T01:00:00Z"));
        assert_eq!(f.scheduler.process_due().await.unwrap(), 1);

        let row = f.schedules.get(id).await.unwrap().unwrap();
        assert_eq!(row.run_count, 1);
        assert_eq!(row.last_run_at, Some(utc("2025-01-01T01:00:00Z")));
        assert_eq!(row.next_run_at, Some(utc("2025-01-01T02:00:00Z")));

        let rows = f.messages.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].message_type, "Tick");
    }

    #[tokio::test]
    async fn once_schedule_fires_and_disables() {
        let start = utc("2025-01-01T00:00:00Z");
        let f = fixture(start);
        let id = f
            .scheduler
            .schedule(
                Message::new("Ping", json!({ "n": 1 })),
                ScheduleSpec::Once {
                    at: start + chrono::Duration::minutes(5),
                },
                ScheduleOptions::default(),
            )
            .await
            .unwrap();

        f.clock.advance(chrono::Duration::minutes(5));
        assert_eq!(f.scheduler.process_due().await.unwrap(), 1);

        let row = f.schedules.get(id).await.unwrap().unwrap();
        assert!(!row.enabled);
        assert_eq!(row.next_run_at, None);
        assert_eq!(row.run_count, 1);

        // Nothing left to fire.
        f.clock.advance(chrono::Duration::minutes(5));
        assert_eq!(f.scheduler.process_due().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn interval_schedule_drifts_when_behind() {
        let start = utc("2025-01-01T00:00:00Z");
        let f = fixture(start);
        let id = f
            .scheduler
            .schedule(
                Message::new("Beat", json!({})),
                ScheduleSpec::Interval {
                    every: Duration::from_secs(60),
                },
                ScheduleOptions::default(),
            )
            .await
            .unwrap();

        // The scheduler is 150s late; next run is computed from dispatch
        // time, not from the missed slot.
        f.clock.advance(chrono::Duration::seconds(150));
        assert_eq!(f.scheduler.process_due().await.unwrap(), 1);

        let row = f.schedules.get(id).await.unwrap().unwrap();
        assert_eq!(
            row.next_run_at,
            Some(start + chrono::Duration::seconds(150 + 60))
        );
    }

    #[tokio::test]
    async fn max_runs_exhausts_the_schedule() {
        let start = utc("2025-01-01T00:00:00Z");
        let f = fixture(start);
        let id = f
            .scheduler
            .schedule(
                Message::new("Beat", json!({})),
                ScheduleSpec::Interval {
                    every: Duration::from_secs(60),
                },
                ScheduleOptions {
                    max_runs: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        for _ in 0..2 {
            f.clock.advance(chrono::Duration::seconds(61));
            assert_eq!(f.scheduler.process_due().await.unwrap(), 1);
        }

        let row = f.schedules.get(id).await.unwrap().unwrap();
        assert_eq!(row.run_count, 2);
        assert!(!row.enabled);
        assert_eq!(row.next_run_at, None);

        f.clock.advance(chrono::Duration::seconds(120));
        assert_eq!(f.scheduler.process_due().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bad_row_is_skipped_and_batch_continues() {
        let start = utc("2025-01-01T00:00:00Z");
        let f = fixture(start);

        // A row with a corrupt config lands directly in the store.
        let bad = ScheduleRow {
            id: Uuid::new_v4(),
            message_type: "Broken".to_string(),
            transport: None,
            body: json!({}),
            headers: Value::Null,
            schedule_type: ScheduleType::Interval,
            schedule_config: json!({}),
            timezone: "UTC".to_string(),
            next_run_at: Some(start),
            last_run_at: None,
            run_count: 0,
            max_runs: None,
            enabled: true,
            created_at: start,
            updated_at: start,
        };
        f.schedules.insert(bad).await.unwrap();

        f.scheduler
            .schedule(
                Message::new("Fine", json!({})),
                ScheduleSpec::Once { at: start },
                ScheduleOptions::default(),
            )
            .await
            .unwrap();

        f.clock.advance(chrono::Duration::seconds(1));
        assert_eq!(f.scheduler.process_due().await.unwrap(), 1);
        assert_eq!(f.messages.rows().len(), 2);
    }

    #[tokio::test]
    async fn disable_enable_delete_lifecycle() {
        let start = utc("2025-01-01T00:00:00Z");
        let f = fixture(start);
        let id = f
            .scheduler
            .schedule(
                Message::new("Beat", json!({})),
                ScheduleSpec::Interval {
                    every: Duration::from_secs(60),
                },
                ScheduleOptions::default(),
            )
            .await
            .unwrap();

        assert!(f.scheduler.disable(id).await.unwrap());
        f.clock.advance(chrono::Duration::seconds(120));
        assert_eq!(f.scheduler.process_due().await.unwrap(), 0);

        assert!(f.scheduler.enable(id).await.unwrap());
        let row = f.schedules.get(id).await.unwrap().unwrap();
        assert!(row.enabled);
        // Re-enabled interval runs one interval from now.
        assert_eq!(
            row.next_run_at,
            Some(f.clock.now() + chrono::Duration::seconds(60))
        );

        assert!(f.scheduler.delete(id).await.unwrap());
        assert!(!f.scheduler.delete(id).await.unwrap());
        assert!(!f.scheduler.disable(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn rejects_invalid_specs() {
        let f = fixture(utc("2025-01-01T00:00:00Z"));

        let result = f
            .scheduler
            .schedule(
                Message::new("Tick", json!({})),
                ScheduleSpec::Interval {
                    every: Duration::ZERO,
                },
                ScheduleOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(MessengerError::Validation(_))));

        let result = f
            .scheduler
            .schedule(
                Message::new("Tick", json!({})),
                ScheduleSpec::Cron {
                    expr: "*/5 * * * *".to_string(),
                },
                ScheduleOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(MessengerError::Validation(_))));

        let result = f
            .scheduler
            .schedule(
                Message::new("Tick", json!({})),
                ScheduleSpec::Cron {
                    expr: "0 * * * *".to_string(),
                },
                ScheduleOptions {
                    timezone: "Mars/Olympus".to_string(),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(MessengerError::Validation(_))));
    }

    #[tokio::test]
    async fn bad_row_message_still_validates() {
        // A row whose stored type no longer passes validation is skipped.
        let start = utc("2025-01-01T00:00:00Z");
        let f = fixture(start);
        let bad = ScheduleRow {
            id: Uuid::new_v4(),
            message_type: "not valid".to_string(),
            transport: None,
            body: json!({}),
            headers: Value::Null,
            schedule_type: ScheduleType::Once,
            schedule_config: json!({ "at": start }),
            timezone: "UTC".to_string(),
            next_run_at: Some(start),
            last_run_at: None,
            run_count: 0,
            max_runs: None,
            enabled: true,
            created_at: start,
            updated_at: start,
        };
        f.schedules.insert(bad).await.unwrap();

        f.clock.advance(chrono::Duration::seconds(1));
        assert_eq!(f.scheduler.process_due().await.unwrap(), 0);
        assert!(f.messages.rows().is_empty());
    }
}
