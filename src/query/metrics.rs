// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-query latency/error aggregation and alerting.
//!
//! Queries and subscription deliveries share this table; deliveries are keyed
//! `subscription:{id}`. Success and failure accounting are kept apart: a
//! failure adds to `total_duration` and `error_count` but never moves the
//! averages or the min/max, so a slow timeout cannot skew latency stats.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::clock::Clock;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryMetric {
    pub query_id: String,
    /// Successes plus failures
    pub execution_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    /// Wall time across every execution, failed ones included
    pub total_duration: Duration,
    /// Fastest success (zero until the first success)
    pub min_duration: Duration,
    pub max_duration: Duration,
    /// Running mean over successes
    pub average_duration_ms: f64,
    pub average_result_count: f64,
    /// Epoch millis of the latest execution
    pub last_executed: i64,
}

impl QueryMetric {
    fn new(query_id: &str) -> Self {
        Self {
            query_id: query_id.to_string(),
            execution_count: 0,
            success_count: 0,
            error_count: 0,
            total_duration: Duration::ZERO,
            min_duration: Duration::ZERO,
            max_duration: Duration::ZERO,
            average_duration_ms: 0.0,
            average_result_count: 0.0,
            last_executed: 0,
        }
    }

    fn record_success(&mut self, duration: Duration, result_count: usize, now: i64) {
        let n = self.success_count as f64;
        let ms = duration.as_secs_f64() * 1000.0;
        self.average_duration_ms = (self.average_duration_ms * n + ms) / (n + 1.0);
        self.average_result_count = (self.average_result_count * n + result_count as f64) / (n + 1.0);

        if self.success_count == 0 {
            self.min_duration = duration;
            self.max_duration = duration;
        } else {
            self.min_duration = self.min_duration.min(duration);
            self.max_duration = self.max_duration.max(duration);
        }
        self.success_count += 1;
        self.execution_count += 1;
        self.total_duration += duration;
        self.last_executed = now;
    }

    fn record_failure(&mut self, duration: Duration, now: i64) {
        self.error_count += 1;
        self.execution_count += 1;
        self.total_duration += duration;
        self.last_executed = now;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryAlert {
    Slow {
        query_id: String,
        duration: Duration,
        threshold: Duration,
    },
    Failed {
        query_id: String,
        error: String,
    },
}

impl QueryAlert {
    pub fn query_id(&self) -> &str {
        match self {
            Self::Slow { query_id, .. } | Self::Failed { query_id, .. } => query_id,
        }
    }
}

pub struct QueryMetrics {
    table: Mutex<HashMap<String, QueryMetric>>,
    alerts: broadcast::Sender<QueryAlert>,
    slow_threshold_ms: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl QueryMetrics {
    pub fn new(clock: Arc<dyn Clock>, alert_capacity: usize, slow_threshold: Duration) -> Self {
        let (alerts, _) = broadcast::channel(alert_capacity.max(1));
        Self {
            table: Mutex::new(HashMap::new()),
            alerts,
            slow_threshold_ms: AtomicU64::new(slow_threshold.as_millis() as u64),
            clock,
        }
    }

    pub fn record_success(&self, query_id: &str, duration: Duration, result_count: usize) {
        let now = self.clock.now_millis();
        self.table
            .lock()
            .entry(query_id.to_string())
            .or_insert_with(|| QueryMetric::new(query_id))
            .record_success(duration, result_count, now);

        let threshold = self.slow_threshold();
        if duration > threshold {
            debug!(query_id, duration_ms = duration.as_millis() as u64, "Slow query");
            self.emit(QueryAlert::Slow {
                query_id: query_id.to_string(),
                duration,
                threshold,
            });
        }
    }

    pub fn record_failure(&self, query_id: &str, duration: Duration, error: &str) {
        let now = self.clock.now_millis();
        self.table
            .lock()
            .entry(query_id.to_string())
            .or_insert_with(|| QueryMetric::new(query_id))
            .record_failure(duration, now);

        warn!(query_id, error, "Query failed");
        self.emit(QueryAlert::Failed {
            query_id: query_id.to_string(),
            error: error.to_string(),
        });
    }

    /// All metrics, sorted by query id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<QueryMetric> {
        let mut metrics: Vec<QueryMetric> = self.table.lock().values().cloned().collect();
        metrics.sort_by(|a, b| a.query_id.cmp(&b.query_id));
        metrics
    }

    #[must_use]
    pub fn get(&self, query_id: &str) -> Option<QueryMetric> {
        self.table.lock().get(query_id).cloned()
    }

    pub fn reset(&self) {
        self.table.lock().clear();
    }

    /// Receivers that fall behind lose the oldest alerts.
    #[must_use]
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<QueryAlert> {
        self.alerts.subscribe()
    }

    pub fn set_slow_threshold(&self, threshold: Duration) {
        self.slow_threshold_ms.store(threshold.as_millis() as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn slow_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_threshold_ms.load(Ordering::Relaxed))
    }

    fn emit(&self, alert: QueryAlert) {
        crate::metrics::record_alert(match alert {
            QueryAlert::Slow { .. } => "slow",
            QueryAlert::Failed { .. } => "failed",
        });
        // No receivers is fine
        let _ = self.alerts.send(alert);
    }
}
