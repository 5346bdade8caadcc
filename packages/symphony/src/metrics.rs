//! Per-attempt metrics collection and windowed aggregation.
//!
//! Attempts land in a bounded in-memory ring (oldest evicted first).
//! Aggregation over a window computes counts, rates, mean and percentile
//! durations, per-type and per-transport breakdowns, and an error-class
//! histogram.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Default ring capacity.
pub const DEFAULT_METRICS_CAPACITY: usize = 10_000;

/// One handler attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    /// Envelope id.
    pub message_id: Uuid,
    /// Message type.
    pub message_type: String,
    /// Transport the attempt ran on.
    pub transport: String,
    /// Queue the envelope was leased from.
    pub queue: String,
    /// Wall-clock duration of the attempt.
    pub duration_ms: u64,
    /// Whether the attempt succeeded.
    pub success: bool,
    /// Failure message, when failed.
    pub error: Option<String>,
    /// Failure class, when failed.
    pub error_class: Option<String>,
    /// Retry count before this attempt.
    pub retry_count: u32,
    /// When the attempt finished.
    pub timestamp: DateTime<Utc>,
}

/// Counts and mean duration for one breakdown bucket.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BucketStats {
    /// Attempts in the bucket.
    pub total: u64,
    /// Successful attempts.
    pub succeeded: u64,
    /// Failed attempts.
    pub failed: u64,
    /// Mean attempt duration in milliseconds.
    pub mean_duration_ms: f64,
}

/// Aggregated view over a time window.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedMetrics {
    /// Window start (inclusive).
    pub window_start: DateTime<Utc>,
    /// Window end (inclusive).
    pub window_end: DateTime<Utc>,
    /// Attempts in the window.
    pub total: u64,
    /// Successful attempts.
    pub succeeded: u64,
    /// Failed attempts.
    pub failed: u64,
    /// succeeded / total (0 when empty).
    pub success_rate: f64,
    /// failed / total (0 when empty).
    pub failure_rate: f64,
    /// Mean attempt duration.
    pub mean_duration_ms: f64,
    /// 50th percentile duration.
    pub p50_duration_ms: u64,
    /// 95th percentile duration.
    pub p95_duration_ms: u64,
    /// 99th percentile duration.
    pub p99_duration_ms: u64,
    /// Breakdown by message type.
    pub per_type: HashMap<String, BucketStats>,
    /// Breakdown by transport.
    pub per_transport: HashMap<String, BucketStats>,
    /// Failure counts by error class.
    pub error_classes: HashMap<String, u64>,
}

/// Bounded ring of attempt records, safe for concurrent appenders.
pub struct MetricsCollector {
    capacity: usize,
    ring: Mutex<VecDeque<AttemptRecord>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_METRICS_CAPACITY)
    }
}

impl MetricsCollector {
    /// Collector bounded at `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    /// Append one attempt, evicting the oldest when full.
    pub fn record(&self, record: AttemptRecord) {
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    /// The most recent `n` records, oldest first.
    pub fn recent(&self, n: usize) -> Vec<AttemptRecord> {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.iter().rev().take(n).rev().cloned().collect()
    }

    /// Number of buffered records.
    pub fn len(&self) -> usize {
        self.ring.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no records are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregate all records with `start <= timestamp <= end`.
    pub fn aggregate(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> AggregatedMetrics {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        let window: Vec<&AttemptRecord> = ring
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp <= end)
            .collect();

        let total = window.len() as u64;
        let succeeded = window.iter().filter(|r| r.success).count() as u64;
        let failed = total - succeeded;

        let mut durations: Vec<u64> = window.iter().map(|r| r.duration_ms).collect();
        durations.sort_unstable();
        let mean_duration_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<u64>() as f64 / durations.len() as f64
        };

        let mut per_type: HashMap<String, BucketStats> = HashMap::new();
        let mut per_transport: HashMap<String, BucketStats> = HashMap::new();
        let mut error_classes: HashMap<String, u64> = HashMap::new();
        for record in &window {
            accumulate(per_type.entry(record.message_type.clone()).or_default(), record);
            accumulate(
                per_transport.entry(record.transport.clone()).or_default(),
                record,
            );
            if !record.success {
                let class = record
                    .error_class
                    .clone()
                    .unwrap_or_else(|| "UnknownError".to_string());
                *error_classes.entry(class).or_insert(0) += 1;
            }
        }
        finalize_means(&mut per_type);
        finalize_means(&mut per_transport);

        AggregatedMetrics {
            window_start: start,
            window_end: end,
            total,
            succeeded,
            failed,
            success_rate: rate(succeeded, total),
            failure_rate: rate(failed, total),
            mean_duration_ms,
            p50_duration_ms: percentile(&durations, 0.50),
            p95_duration_ms: percentile(&durations, 0.95),
            p99_duration_ms: percentile(&durations, 0.99),
            per_type,
            per_transport,
            error_classes,
        }
    }
}

fn accumulate(bucket: &mut BucketStats, record: &AttemptRecord) {
    bucket.total += 1;
    if record.success {
        bucket.succeeded += 1;
    } else {
        bucket.failed += 1;
    }
    // mean_duration_ms holds a running sum until finalize_means divides it.
    bucket.mean_duration_ms += record.duration_ms as f64;
}

fn finalize_means(buckets: &mut HashMap<String, BucketStats>) {
    for bucket in buckets.values_mut() {
        if bucket.total > 0 {
            bucket.mean_duration_ms /= bucket.total as f64;
        }
    }
}

fn rate(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// Percentile by rank `ceil(n * p) - 1` on a sorted sample, clamped.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (sorted.len() as f64 * p).ceil() as usize;
    let index = rank.saturating_sub(1).min(sorted.len() - 1);
    sorted[index]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(duration_ms: u64, success: bool, at: DateTime<Utc>) -> AttemptRecord {
        AttemptRecord {
            message_id: Uuid::new_v4(),
            message_type: "Work".to_string(),
            transport: "durable".to_string(),
            queue: "default".to_string(),
            duration_ms,
            success,
            error: (!success).then(|| "timeout".to_string()),
            error_class: (!success).then(|| "HandlerError".to_string()),
            retry_count: 0,
            timestamp: at,
        }
    }

    #[test]
    fn ring_is_bounded() {
        let collector = MetricsCollector::new(3);
        let now = Utc::now();
        for duration in [1, 2, 3, 4] {
            collector.record(record(duration, true, now));
        }

        assert_eq!(collector.len(), 3);
        let recent = collector.recent(10);
        assert_eq!(recent[0].duration_ms, 2);
        assert_eq!(recent[2].duration_ms, 4);
    }

    #[test]
    fn aggregate_counts_and_rates() {
        let collector = MetricsCollector::default();
        let now = Utc::now();
        for _ in 0..9 {
            collector.record(record(10, true, now));
        }
        collector.record(record(10, false, now));

        let agg = collector.aggregate(now - Duration::minutes(1), now + Duration::minutes(1));
        assert_eq!(agg.total, 10);
        assert_eq!(agg.succeeded, 9);
        assert_eq!(agg.failed, 1);
        assert!((agg.success_rate - 0.9).abs() < f64::EPSILON);
        assert!((agg.failure_rate - 0.1).abs() < f64::EPSILON);
        assert_eq!(agg.error_classes.get("HandlerError"), Some(&1));
    }

    #[test]
    fn aggregate_respects_window() {
        let collector = MetricsCollector::default();
        let now = Utc::now();
        collector.record(record(10, true, now - Duration::hours(2)));
        collector.record(record(10, true, now));

        let agg = collector.aggregate(now - Duration::minutes(5), now + Duration::minutes(5));
        assert_eq!(agg.total, 1);
    }

    #[test]
    fn percentile_uses_ceil_rank() {
        // n = 10, p50 → rank ceil(5) = 5 → index 4; p95 → ceil(9.5) = 10 → index 9.
        let sorted: Vec<u64> = (1..=10).collect();
        assert_eq!(percentile(&sorted, 0.50), 5);
        assert_eq!(percentile(&sorted, 0.95), 10);
        assert_eq!(percentile(&sorted, 0.99), 10);
        assert_eq!(percentile(&[], 0.5), 0);
        assert_eq!(percentile(&[7], 0.99), 7);
    }

    #[test]
    fn per_bucket_means_are_divided() {
        let collector = MetricsCollector::default();
        let now = Utc::now();
        collector.record(record(10, true, now));
        collector.record(record(30, true, now));

        let agg = collector.aggregate(now - Duration::minutes(1), now + Duration::minutes(1));
        let bucket = agg.per_type.get("Work").unwrap();
        assert_eq!(bucket.total, 2);
        assert!((bucket.mean_duration_ms - 20.0).abs() < f64::EPSILON);
    }
}
