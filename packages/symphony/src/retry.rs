//! Retry strategy and the retry / dead-letter decision.
//!
//! Exponential backoff with symmetric jitter. The strategy computes delays
//! and retryability; [`RetryManager`] combines both with the envelope's retry
//! budget into a single decision the worker acts on.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::config::{RetryPolicy, RuntimeConfigManager};
use crate::error::HandlerError;
use crate::message::Envelope;

/// Jitter half-width: delays vary uniformly within ±10%.
const JITTER_FRACTION: f64 = 0.1;

/// Exponential backoff with jitter for a single retry policy.
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    policy: RetryPolicy,
}

impl RetryStrategy {
    /// Strategy over the given policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Delay before the retry following the `retry_count`-th failure.
    ///
    /// `base * multiplier^retry_count`, capped at the policy ceiling, with
    /// uniform ±10% jitter, rounded to whole milliseconds.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let raw = self.policy.delay_ms as f64 * self.policy.multiplier.powi(retry_count as i32);
        let capped = raw.min(self.policy.max_delay_ms as f64);
        let jitter = 1.0 + (fastrand::f64() * 2.0 - 1.0) * JITTER_FRACTION;
        let millis = (capped * jitter).round().max(0.0) as u64;
        Duration::from_millis(millis)
    }

    /// Whether another attempt fits in the retry budget.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.policy.max_retries
    }

    /// Whether the failure itself admits a retry.
    pub fn is_retryable(&self, error: &HandlerError) -> bool {
        error.retryable
    }

    /// The policy this strategy was built from.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

/// Outcome of a retry decision for one failed attempt.
#[derive(Debug, Clone)]
pub struct RetryDecision {
    /// Reschedule (`true`) or dead-letter (`false`).
    pub should_retry: bool,
    /// Backoff delay when rescheduling.
    pub delay: Duration,
    /// Instant the envelope becomes leasable again.
    pub next_available_at: Option<DateTime<Utc>>,
    /// Retry count to record on the rescheduled envelope.
    pub new_retry_count: u32,
}

/// Decides between reschedule and dead-letter after a failed attempt.
pub struct RetryManager {
    config: Arc<RuntimeConfigManager>,
    clock: Arc<dyn Clock>,
}

impl RetryManager {
    /// Manager reading per-type policies from the live config.
    pub fn new(config: Arc<RuntimeConfigManager>, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    /// Decide what happens to `envelope` after `error`.
    ///
    /// `retry_count` counts observed failures: a retryable failure records
    /// one more, and the budget check runs on the recorded count, so an
    /// envelope with `max_retries = 3` makes at most three attempts. A
    /// non-retryable failure dead-letters without touching the count.
    pub fn determine(&self, envelope: &Envelope, error: &HandlerError) -> RetryDecision {
        let policy = self
            .config
            .snapshot()
            .retry_policy_for(&envelope.message.message_type);
        let strategy = RetryStrategy::new(policy);

        let prior_failures = envelope.delivery.retry_count;
        let max_retries = envelope.delivery.max_retries;

        if !strategy.is_retryable(error) {
            return RetryDecision {
                should_retry: false,
                delay: Duration::ZERO,
                next_available_at: None,
                new_retry_count: prior_failures,
            };
        }

        let recorded = prior_failures + 1;
        if recorded < max_retries {
            let delay = strategy.delay(prior_failures);
            let next_available_at =
                self.clock.now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
            RetryDecision {
                should_retry: true,
                delay,
                next_available_at: Some(next_available_at),
                new_retry_count: recorded,
            }
        } else {
            RetryDecision {
                should_retry: false,
                delay: Duration::ZERO,
                next_available_at: None,
                new_retry_count: recorded.min(max_retries),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::MessengerConfig;
    use crate::message::{DeliveryInfo, Message};
    use serde_json::json;
    use uuid::Uuid;

    fn strategy(delay_ms: u64, multiplier: f64, max_delay_ms: u64) -> RetryStrategy {
        RetryStrategy::new(RetryPolicy {
            max_retries: 3,
            delay_ms,
            multiplier,
            max_delay_ms,
        })
    }

    fn envelope(retry_count: u32, max_retries: u32) -> Envelope {
        Envelope {
            id: Uuid::new_v4(),
            message: Message::new("Work", json!({})),
            transport_name: "durable".to_string(),
            queue_name: "default".to_string(),
            priority: 5,
            idempotency_key: None,
            scheduled_at: None,
            available_at: Utc::now(),
            created_at: Utc::now(),
            delivery: DeliveryInfo {
                retry_count,
                ..DeliveryInfo::new(max_retries)
            },
        }
    }

    fn manager() -> RetryManager {
        let config = Arc::new(RuntimeConfigManager::new(MessengerConfig::default()).unwrap());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        RetryManager::new(config, clock)
    }

    #[test]
    fn delay_grows_exponentially_within_jitter() {
        let strategy = strategy(100, 2.0, 10_000);
        for (retry_count, expected) in [(0u32, 100f64), (1, 200.0), (2, 400.0), (3, 800.0)] {
            for _ in 0..50 {
                let ms = strategy.delay(retry_count).as_millis() as f64;
                assert!(
                    ms >= (expected * 0.9).floor() && ms <= (expected * 1.1).ceil(),
                    "retry {retry_count}: {ms}ms outside jitter band around {expected}ms"
                );
            }
        }
    }

    #[test]
    fn delay_is_capped_before_jitter() {
        let strategy = strategy(100, 2.0, 500);
        for _ in 0..50 {
            let ms = strategy.delay(10).as_millis() as f64;
            assert!(ms <= 550.0, "{ms}ms exceeds cap plus jitter");
            assert!(ms >= 450.0, "{ms}ms below cap minus jitter");
        }
    }

    #[test]
    fn should_retry_respects_budget() {
        let strategy = strategy(100, 2.0, 1_000);
        assert!(strategy.should_retry(0));
        assert!(strategy.should_retry(2));
        assert!(!strategy.should_retry(3));
    }

    #[test]
    fn retryable_failure_within_budget_reschedules() {
        let decision = manager().determine(&envelope(0, 3), &HandlerError::retryable("connection reset"));
        assert!(decision.should_retry);
        assert_eq!(decision.new_retry_count, 1);
        assert!(decision.next_available_at.is_some());
    }

    #[test]
    fn final_allowed_attempt_dead_letters_with_full_count() {
        // Two failures recorded; this third (and last) attempt exhausts the
        // budget of three, so no fourth attempt is scheduled.
        let decision = manager().determine(&envelope(2, 3), &HandlerError::retryable("timeout"));
        assert!(!decision.should_retry);
        assert_eq!(decision.new_retry_count, 3);
        assert!(decision.next_available_at.is_none());
    }

    #[test]
    fn non_retryable_failure_dead_letters_without_counting() {
        let decision = manager().determine(&envelope(0, 3), &HandlerError::permanent("bad input"));
        assert!(!decision.should_retry);
        assert_eq!(decision.new_retry_count, 0);
    }
}
