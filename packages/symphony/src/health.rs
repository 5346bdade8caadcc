//! Health rollup over transports and recent metrics.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::clock::Clock;
use crate::dispatcher::TransportRegistry;
use crate::metrics::MetricsCollector;

/// Failure rate below which processing is healthy.
const FAILURE_RATE_HEALTHY: f64 = 0.01;
/// Failure rate below which processing is degraded rather than unhealthy.
const FAILURE_RATE_DEGRADED: f64 = 0.10;
/// Mean latency below which processing is healthy.
const LATENCY_HEALTHY_MS: f64 = 1_000.0;
/// Mean latency below which processing is degraded rather than unhealthy.
const LATENCY_DEGRADED_MS: f64 = 5_000.0;

/// Health of one constituent or of the whole messenger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Operating normally.
    Healthy,
    /// Operating with elevated failure rate, latency, or no throughput.
    Degraded,
    /// Not operating acceptably.
    Unhealthy,
}

/// One constituent check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// Check name, e.g. `"transport:durable"` or `"failure_rate"`.
    pub name: String,
    /// Status of this constituent.
    pub status: HealthStatus,
    /// Human-readable detail.
    pub detail: String,
}

/// Rollup of all constituent checks. Overall status is the worst.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Worst constituent status.
    pub status: HealthStatus,
    /// All constituent checks.
    pub checks: Vec<HealthCheck>,
    /// When the evaluation ran.
    pub checked_at: DateTime<Utc>,
}

/// Evaluates transport reachability, failure rate, throughput and latency.
pub struct HealthMonitor {
    transports: Arc<TransportRegistry>,
    metrics: Arc<MetricsCollector>,
    clock: Arc<dyn Clock>,
    window: Duration,
}

impl HealthMonitor {
    /// Monitor over the installed transports and the metrics ring, judging
    /// the trailing `window`.
    pub fn new(
        transports: Arc<TransportRegistry>,
        metrics: Arc<MetricsCollector>,
        clock: Arc<dyn Clock>,
        window: Duration,
    ) -> Self {
        Self {
            transports,
            metrics,
            clock,
            window,
        }
    }

    /// Run all constituent checks and roll them up.
    pub async fn evaluate(&self) -> HealthSnapshot {
        let now = self.clock.now();
        let mut checks = Vec::new();

        for transport in self.transports.all() {
            let name = format!("transport:{}", transport.name());
            match transport.queue_depth(None).await {
                Ok(depth) => checks.push(HealthCheck {
                    name,
                    status: HealthStatus::Healthy,
                    detail: format!("reachable, queue depth {depth}"),
                }),
                Err(err) => checks.push(HealthCheck {
                    name,
                    status: HealthStatus::Unhealthy,
                    detail: format!("unreachable: {err}"),
                }),
            }
        }

        let agg = self.metrics.aggregate(now - self.window, now);

        let failure_status = if agg.total == 0 || agg.failure_rate < FAILURE_RATE_HEALTHY {
            HealthStatus::Healthy
        } else if agg.failure_rate < FAILURE_RATE_DEGRADED {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };
        checks.push(HealthCheck {
            name: "failure_rate".to_string(),
            status: failure_status,
            detail: format!(
                "{:.2}% of {} attempts failed",
                agg.failure_rate * 100.0,
                agg.total
            ),
        });

        checks.push(HealthCheck {
            name: "throughput".to_string(),
            status: if agg.total > 0 {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            detail: format!("{} attempts in the window", agg.total),
        });

        let latency_status = if agg.total == 0 || agg.mean_duration_ms < LATENCY_HEALTHY_MS {
            HealthStatus::Healthy
        } else if agg.mean_duration_ms < LATENCY_DEGRADED_MS {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };
        checks.push(HealthCheck {
            name: "latency".to_string(),
            status: latency_status,
            detail: format!("mean attempt duration {:.0}ms", agg.mean_duration_ms),
        });

        let status = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        HealthSnapshot {
            status,
            checks,
            checked_at: now,
        }
    }
}
