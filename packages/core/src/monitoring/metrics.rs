//! Metric registry: counters, gauges and histograms with bounded history.
//!
//! Every write appends a `(timestamp, value)` point and prunes history
//! older than the retention window, so a metric's history never contains a
//! point older than the retention at the time of the next write. Reads are
//! snapshots; the registry lock is held only for the copy.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::common::Clock;

/// Core metric names every conforming deployment exposes.
pub mod names {
    pub const TASK_SUCCESS_RATE: &str = "task_success_rate";
    pub const TASK_DURATION: &str = "task_duration";
    pub const TASK_COUNT: &str = "task_count";
    pub const TASK_FAILED_COUNT: &str = "task_failed_count";
    pub const QUEUE_DEPTH: &str = "queue_depth";
    pub const QUEUE_WAIT_TIME: &str = "queue_wait_time";
    pub const API_REQUEST_COUNT: &str = "api_request_count";
    pub const API_RESPONSE_TIME: &str = "api_response_time";
    pub const API_ERROR_RATE: &str = "api_error_rate";
    pub const API_ERROR_COUNT: &str = "api_error_count";
    pub const AGENT_ACTIVE_COUNT: &str = "agent_active_count";
    pub const AGENT_IDLE_COUNT: &str = "agent_idle_count";
    pub const AGENT_TASK_DURATION: &str = "agent_task_duration";
    pub const SYSTEM_CPU_USAGE: &str = "system_cpu_usage";
    pub const SYSTEM_MEMORY_USAGE: &str = "system_memory_usage";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub metric_type: MetricType,
    /// Counters: running total. Gauges: last set value. Histograms: last
    /// recorded observation.
    pub value: f64,
    pub unit: Option<String>,
    pub tags: HashMap<String, String>,
    pub history: VecDeque<MetricPoint>,
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub retention: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(60 * 60),
        }
    }
}

pub struct MetricsService {
    clock: Arc<dyn Clock>,
    config: MetricsConfig,
    metrics: RwLock<HashMap<String, Metric>>,
}

impl MetricsService {
    pub fn new(clock: Arc<dyn Clock>, config: MetricsConfig) -> Self {
        Self {
            clock,
            config,
            metrics: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_defaults(clock: Arc<dyn Clock>) -> Self {
        Self::new(clock, MetricsConfig::default())
    }

    fn write(&self, name: &str, metric_type: MetricType, update: impl FnOnce(&mut Metric)) {
        let now = self.clock.now();
        let mut metrics = self.metrics.write();
        let metric = metrics.entry(name.to_string()).or_insert_with(|| Metric {
            name: name.to_string(),
            metric_type,
            value: 0.0,
            unit: None,
            tags: HashMap::new(),
            history: VecDeque::new(),
        });
        update(metric);
        metric.history.push_back(MetricPoint {
            timestamp: now,
            value: metric.value,
        });

        let cutoff = now
            - chrono::Duration::from_std(self.config.retention)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        while metric
            .history
            .front()
            .map(|p| p.timestamp < cutoff)
            .unwrap_or(false)
        {
            metric.history.pop_front();
        }
    }

    // Primitive writes --------------------------------------------------

    pub fn increment_counter(&self, name: &str, delta: f64) {
        self.write(name, MetricType::Counter, |m| m.value += delta);
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        self.write(name, MetricType::Gauge, |m| m.value = value);
    }

    pub fn record_histogram(&self, name: &str, value: f64) {
        self.write(name, MetricType::Histogram, |m| m.value = value);
    }

    // Reads -------------------------------------------------------------

    pub fn get_value(&self, name: &str) -> Option<f64> {
        self.metrics.read().get(name).map(|m| m.value)
    }

    pub fn get_metric(&self, name: &str) -> Option<Metric> {
        self.metrics.read().get(name).cloned()
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.metrics.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// History inside `window` (or everything retained).
    pub fn get_history(&self, name: &str, window: Option<Duration>) -> Vec<MetricPoint> {
        let metrics = self.metrics.read();
        let Some(metric) = metrics.get(name) else {
            return Vec::new();
        };
        match window {
            None => metric.history.iter().copied().collect(),
            Some(window) => {
                let cutoff = self.clock.now()
                    - chrono::Duration::from_std(window)
                        .unwrap_or_else(|_| chrono::Duration::hours(1));
                metric
                    .history
                    .iter()
                    .filter(|p| p.timestamp >= cutoff)
                    .copied()
                    .collect()
            }
        }
    }

    pub fn get_average(&self, name: &str, window: Option<Duration>) -> Option<f64> {
        let points = self.get_history(name, window);
        if points.is_empty() {
            return None;
        }
        Some(points.iter().map(|p| p.value).sum::<f64>() / points.len() as f64)
    }

    /// Nearest-rank percentile over the (windowed) history.
    pub fn get_percentile(&self, name: &str, percentile: f64, window: Option<Duration>) -> Option<f64> {
        let mut values: Vec<f64> = self
            .get_history(name, window)
            .iter()
            .map(|p| p.value)
            .collect();
        if values.is_empty() {
            return None;
        }
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((percentile / 100.0) * values.len() as f64).ceil() as usize;
        let index = rank.clamp(1, values.len()) - 1;
        Some(values[index])
    }

    // Convenience recorders ---------------------------------------------

    /// Task family: count, failures, duration histogram and derived
    /// success rate.
    pub fn record_task_execution(&self, success: bool, duration_ms: u64) {
        self.increment_counter(names::TASK_COUNT, 1.0);
        if !success {
            self.increment_counter(names::TASK_FAILED_COUNT, 1.0);
        }
        self.record_histogram(names::TASK_DURATION, duration_ms as f64);

        let total = self.get_value(names::TASK_COUNT).unwrap_or(0.0);
        let failed = self.get_value(names::TASK_FAILED_COUNT).unwrap_or(0.0);
        let rate = if total > 0.0 {
            (total - failed) / total * 100.0
        } else {
            0.0
        };
        self.set_gauge(names::TASK_SUCCESS_RATE, rate);
    }

    /// Queue family.
    pub fn record_queue_depth(&self, depth: u64) {
        self.set_gauge(names::QUEUE_DEPTH, depth as f64);
    }

    pub fn record_queue_wait(&self, wait_ms: u64) {
        self.record_histogram(names::QUEUE_WAIT_TIME, wait_ms as f64);
    }

    /// API family. The error rate reports 0 while no requests have been
    /// recorded, even if errors were counted through another path.
    pub fn record_api_request(&self, is_error: bool, duration_ms: u64) {
        self.increment_counter(names::API_REQUEST_COUNT, 1.0);
        if is_error {
            self.increment_counter(names::API_ERROR_COUNT, 1.0);
        }
        self.record_histogram(names::API_RESPONSE_TIME, duration_ms as f64);

        let requests = self.get_value(names::API_REQUEST_COUNT).unwrap_or(0.0);
        let errors = self.get_value(names::API_ERROR_COUNT).unwrap_or(0.0);
        let rate = if requests > 0.0 {
            errors / requests * 100.0
        } else {
            0.0
        };
        self.set_gauge(names::API_ERROR_RATE, rate);
    }

    /// Agent family.
    pub fn record_agent_counts(&self, idle: u64, active: u64) {
        self.set_gauge(names::AGENT_IDLE_COUNT, idle as f64);
        self.set_gauge(names::AGENT_ACTIVE_COUNT, active as f64);
    }

    pub fn record_agent_task_duration(&self, duration_ms: u64) {
        self.record_histogram(names::AGENT_TASK_DURATION, duration_ms as f64);
    }

    /// System family, fed by the infrastructure monitor.
    pub fn record_system_usage(&self, cpu_percent: f64, memory_percent: f64) {
        self.set_gauge(names::SYSTEM_CPU_USAGE, cpu_percent);
        self.set_gauge(names::SYSTEM_MEMORY_USAGE, memory_percent);
    }
}
