//! Business monitor: per-task-type outcomes, processing time and
//! throughput, rolled up into an overall business health classification.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::common::Clock;
use crate::monitoring::application::ComponentHealth;
use crate::monitoring::metrics::MetricsService;

/// Moving-average window over processing durations, per task type.
const DURATION_WINDOW: usize = 50;

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskTypeStats {
    pub attempts: u64,
    pub successes: u64,
    /// Moving average over the last [`DURATION_WINDOW`] durations.
    pub average_duration_ms: f64,
    /// Completions inside the last minute.
    pub throughput_per_minute: u64,
}

impl TaskTypeStats {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.successes as f64 / self.attempts as f64 * 100.0
    }
}

#[derive(Default)]
struct TypeState {
    attempts: u64,
    successes: u64,
    durations: VecDeque<u64>,
    completions: VecDeque<DateTime<Utc>>,
}

pub struct BusinessMonitor {
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsService>,
    types: RwLock<HashMap<String, TypeState>>,
}

impl BusinessMonitor {
    pub fn new(clock: Arc<dyn Clock>, metrics: Arc<MetricsService>) -> Self {
        Self {
            clock,
            metrics,
            types: RwLock::new(HashMap::new()),
        }
    }

    pub fn record_task_result(&self, task_type: &str, success: bool, duration_ms: u64) {
        let now = self.clock.now();
        {
            let mut types = self.types.write();
            let state = types.entry(task_type.to_string()).or_default();
            state.attempts += 1;
            if success {
                state.successes += 1;
            }
            state.durations.push_back(duration_ms);
            while state.durations.len() > DURATION_WINDOW {
                state.durations.pop_front();
            }
            state.completions.push_back(now);
            let cutoff = now - chrono::Duration::seconds(60);
            while state
                .completions
                .front()
                .map(|t| *t < cutoff)
                .unwrap_or(false)
            {
                state.completions.pop_front();
            }
        }
        self.metrics.record_task_execution(success, duration_ms);
    }

    pub fn task_type_stats(&self, task_type: &str) -> Option<TaskTypeStats> {
        let now = self.clock.now();
        let types = self.types.read();
        let state = types.get(task_type)?;
        let cutoff = now - chrono::Duration::seconds(60);
        Some(TaskTypeStats {
            attempts: state.attempts,
            successes: state.successes,
            average_duration_ms: if state.durations.is_empty() {
                0.0
            } else {
                state.durations.iter().sum::<u64>() as f64 / state.durations.len() as f64
            },
            throughput_per_minute: state
                .completions
                .iter()
                .filter(|t| **t >= cutoff)
                .count() as u64,
        })
    }

    pub fn all_stats(&self) -> HashMap<String, TaskTypeStats> {
        let names: Vec<String> = self.types.read().keys().cloned().collect();
        names
            .into_iter()
            .filter_map(|name| self.task_type_stats(&name).map(|s| (name, s)))
            .collect()
    }

    /// Overall business health from the aggregate success rate:
    /// healthy at >= 95%, degraded at >= 80%, unhealthy below.
    pub fn overall_health(&self) -> ComponentHealth {
        let types = self.types.read();
        let (attempts, successes) = types.values().fold((0u64, 0u64), |(a, s), state| {
            (a + state.attempts, s + state.successes)
        });
        if attempts == 0 {
            return ComponentHealth::Healthy;
        }
        let rate = successes as f64 / attempts as f64 * 100.0;
        if rate >= 95.0 {
            ComponentHealth::Healthy
        } else if rate >= 80.0 {
            ComponentHealth::Degraded
        } else {
            ComponentHealth::Unhealthy
        }
    }
}
