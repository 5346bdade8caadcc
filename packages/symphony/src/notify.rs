//! Failure notifications.
//!
//! Registered channels (log, webhook, Slack, custom) receive notifications at
//! or above a severity threshold. Delivery is fire-and-forget through a
//! bounded queue: a slow or failing channel never blocks the worker, and
//! overflow drops the notification with a log line.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::HandlerError;

/// Default notification queue capacity.
pub const DEFAULT_NOTIFY_QUEUE: usize = 256;

/// Notification severity, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// First failure of an envelope with retries remaining.
    Info,
    /// Repeated failure; the envelope is being retried.
    Warning,
    /// Dead-lettered or non-retryable failure.
    Critical,
}

impl Severity {
    /// Derive severity from the failure and delivery state.
    pub fn derive(error: &HandlerError, retry_count: u32, dead_letter: bool) -> Self {
        if dead_letter || !error.retryable {
            Self::Critical
        } else if retry_count > 0 {
            Self::Warning
        } else {
            Self::Info
        }
    }
}

/// One failure notification.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    /// Severity of the event.
    pub severity: Severity,
    /// Envelope id.
    pub message_id: Uuid,
    /// Message type.
    pub message_type: String,
    /// Failure message.
    pub error: String,
    /// Failure class.
    pub error_class: String,
    /// Failures observed so far.
    pub retry_count: u32,
    /// Whether the envelope was dead-lettered.
    pub dead_letter: bool,
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
}

/// A delivery channel for notifications.
#[async_trait::async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Channel label used in logs (`"log"`, `"webhook"`, `"slack"`, ...).
    fn channel(&self) -> &str;

    /// Deliver one notification. Errors are logged, never propagated.
    async fn send(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Channel that writes structured log events.
#[derive(Debug, Default)]
pub struct LogChannel;

#[async_trait::async_trait]
impl NotificationChannel for LogChannel {
    fn channel(&self) -> &str {
        "log"
    }

    async fn send(&self, n: &Notification) -> anyhow::Result<()> {
        match n.severity {
            Severity::Critical => error!(
                message_id = %n.message_id,
                message_type = %n.message_type,
                error = %n.error,
                error_class = %n.error_class,
                retry_count = n.retry_count,
                dead_letter = n.dead_letter,
                "message failure"
            ),
            Severity::Warning => warn!(
                message_id = %n.message_id,
                message_type = %n.message_type,
                error = %n.error,
                retry_count = n.retry_count,
                "message failure"
            ),
            Severity::Info => info!(
                message_id = %n.message_id,
                message_type = %n.message_type,
                error = %n.error,
                "message failure"
            ),
        }
        Ok(())
    }
}

/// Channel that POSTs the notification as JSON to a webhook URL.
pub struct WebhookChannel {
    url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    /// Channel posting to `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl NotificationChannel for WebhookChannel {
    fn channel(&self) -> &str {
        "webhook"
    }

    async fn send(&self, n: &Notification) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .json(n)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Channel that posts a Slack incoming-webhook message.
pub struct SlackChannel {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackChannel {
    /// Channel posting to a Slack incoming webhook.
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl NotificationChannel for SlackChannel {
    fn channel(&self) -> &str {
        "slack"
    }

    async fn send(&self, n: &Notification) -> anyhow::Result<()> {
        let text = format!(
            "{:?}: {} `{}` failed ({}): {}",
            n.severity, n.message_type, n.message_id, n.error_class, n.error
        );
        self.client
            .post(&self.webhook_url)
            .json(&json!({ "text": text }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Fans notifications out to registered channels, best-effort.
pub struct Notifier {
    threshold: Severity,
    tx: mpsc::Sender<Notification>,
}

impl Notifier {
    /// Start a notifier with the given channels and severity threshold.
    ///
    /// A background task drains the queue and delivers to every channel; it
    /// stops when the notifier is dropped.
    pub fn start(channels: Vec<Arc<dyn NotificationChannel>>, threshold: Severity) -> Arc<Self> {
        Self::start_with_capacity(channels, threshold, DEFAULT_NOTIFY_QUEUE)
    }

    /// As [`Notifier::start`], with an explicit queue capacity.
    pub fn start_with_capacity(
        channels: Vec<Arc<dyn NotificationChannel>>,
        threshold: Severity,
        capacity: usize,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<Notification>(capacity.max(1));

        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                for channel in &channels {
                    if let Err(err) = channel.send(&notification).await {
                        warn!(
                            channel = channel.channel(),
                            error = %err,
                            "notification delivery failed"
                        );
                    }
                }
            }
            debug!("notifier drain task stopped");
        });

        Arc::new(Self { threshold, tx })
    }

    /// Enqueue a notification. Below-threshold events and overflow are
    /// dropped; this never blocks.
    pub fn notify(&self, notification: Notification) {
        if notification.severity < self.threshold {
            return;
        }
        if let Err(err) = self.tx.try_send(notification) {
            warn!(error = %err, "notification queue full, dropping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration};

    fn notification(severity: Severity) -> Notification {
        Notification {
            severity,
            message_id: Uuid::new_v4(),
            message_type: "Work".to_string(),
            error: "boom".to_string(),
            error_class: "HandlerError".to_string(),
            retry_count: 0,
            dead_letter: false,
            timestamp: Utc::now(),
        }
    }

    struct CountingChannel {
        delivered: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl NotificationChannel for CountingChannel {
        fn channel(&self) -> &str {
            "counting"
        }

        async fn send(&self, _n: &Notification) -> anyhow::Result<()> {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("channel down");
            }
            Ok(())
        }
    }

    #[test]
    fn severity_derivation() {
        let retryable = HandlerError::retryable("timeout");
        assert_eq!(Severity::derive(&retryable, 0, false), Severity::Info);
        assert_eq!(Severity::derive(&retryable, 2, false), Severity::Warning);
        assert_eq!(Severity::derive(&retryable, 2, true), Severity::Critical);

        let permanent = HandlerError::permanent("bad");
        assert_eq!(Severity::derive(&permanent, 0, false), Severity::Critical);
    }

    #[tokio::test]
    async fn below_threshold_notifications_are_dropped() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let notifier = Notifier::start(
            vec![Arc::new(CountingChannel {
                delivered: delivered.clone(),
                fail: false,
            })],
            Severity::Warning,
        );

        notifier.notify(notification(Severity::Info));
        notifier.notify(notification(Severity::Critical));
        sleep(Duration::from_millis(50)).await;

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_channel_does_not_stop_the_others() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let notifier = Notifier::start(
            vec![
                Arc::new(CountingChannel {
                    delivered: first.clone(),
                    fail: true,
                }),
                Arc::new(CountingChannel {
                    delivered: second.clone(),
                    fail: false,
                }),
            ],
            Severity::Info,
        );

        notifier.notify(notification(Severity::Critical));
        sleep(Duration::from_millis(50)).await;

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
