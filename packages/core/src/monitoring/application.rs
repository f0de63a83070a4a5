//! Application monitor: per-endpoint request stats, queue depth/wait and
//! cache effectiveness, with derived component health.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::monitoring::metrics::MetricsService;

/// Requests slower than this count as "slow" for health purposes.
pub const SLOW_REQUEST_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EndpointStats {
    pub request_count: u64,
    pub error_count: u64,
    pub slow_count: u64,
    pub total_response_ms: u64,
    pub status_codes: HashMap<u16, u64>,
}

impl EndpointStats {
    pub fn average_response_ms(&self) -> f64 {
        if self.request_count == 0 {
            return 0.0;
        }
        self.total_response_ms as f64 / self.request_count as f64
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            return 0.0;
        }
        self.error_count as f64 / self.request_count as f64 * 100.0
    }

    fn slow_rate(&self) -> f64 {
        if self.request_count == 0 {
            return 0.0;
        }
        self.slow_count as f64 / self.request_count as f64 * 100.0
    }

    /// Degraded above 5% errors or slow requests, unhealthy above 20%.
    pub fn health(&self) -> ComponentHealth {
        let error = self.error_rate();
        let slow = self.slow_rate();
        if error > 20.0 || slow > 20.0 {
            ComponentHealth::Unhealthy
        } else if error > 5.0 || slow > 5.0 {
            ComponentHealth::Degraded
        } else {
            ComponentHealth::Healthy
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueDepthStats {
    pub depth: u64,
    pub samples: u64,
    pub total_wait_ms: u64,
}

impl QueueDepthStats {
    pub fn average_wait_ms(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.total_wait_ms as f64 / self.samples as f64
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64 * 100.0
    }
}

#[derive(Default)]
struct State {
    endpoints: HashMap<String, EndpointStats>,
    queues: HashMap<String, QueueDepthStats>,
    cache: CacheStats,
}

pub struct ApplicationMonitor {
    metrics: Arc<MetricsService>,
    state: RwLock<State>,
}

impl ApplicationMonitor {
    pub fn new(metrics: Arc<MetricsService>) -> Self {
        Self {
            metrics,
            state: RwLock::new(State::default()),
        }
    }

    pub fn record_request(&self, endpoint: &str, status_code: u16, duration_ms: u64) {
        let is_error = status_code >= 500;
        {
            let mut state = self.state.write();
            let stats = state.endpoints.entry(endpoint.to_string()).or_default();
            stats.request_count += 1;
            stats.total_response_ms += duration_ms;
            if is_error {
                stats.error_count += 1;
            }
            if duration_ms > SLOW_REQUEST_MS {
                stats.slow_count += 1;
            }
            *stats.status_codes.entry(status_code).or_insert(0) += 1;
        }
        self.metrics.record_api_request(is_error, duration_ms);
    }

    pub fn record_queue_sample(&self, queue: &str, depth: u64, wait_ms: u64) {
        {
            let mut state = self.state.write();
            let stats = state.queues.entry(queue.to_string()).or_default();
            stats.depth = depth;
            stats.samples += 1;
            stats.total_wait_ms += wait_ms;
        }
        self.metrics.record_queue_depth(depth);
        self.metrics.record_queue_wait(wait_ms);
    }

    pub fn record_cache_hit(&self) {
        self.state.write().cache.hits += 1;
    }

    pub fn record_cache_miss(&self) {
        self.state.write().cache.misses += 1;
    }

    pub fn endpoint_stats(&self, endpoint: &str) -> Option<EndpointStats> {
        self.state.read().endpoints.get(endpoint).cloned()
    }

    pub fn endpoint_health(&self, endpoint: &str) -> ComponentHealth {
        self.state
            .read()
            .endpoints
            .get(endpoint)
            .map(|s| s.health())
            .unwrap_or(ComponentHealth::Healthy)
    }

    pub fn queue_stats(&self, queue: &str) -> Option<QueueDepthStats> {
        self.state.read().queues.get(queue).cloned()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.state.read().cache
    }

    /// Worst health across all tracked endpoints.
    pub fn overall_health(&self) -> ComponentHealth {
        let state = self.state.read();
        let mut overall = ComponentHealth::Healthy;
        for stats in state.endpoints.values() {
            match stats.health() {
                ComponentHealth::Unhealthy => return ComponentHealth::Unhealthy,
                ComponentHealth::Degraded => overall = ComponentHealth::Degraded,
                ComponentHealth::Healthy => {}
            }
        }
        overall
    }
}
