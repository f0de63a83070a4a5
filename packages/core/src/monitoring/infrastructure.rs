//! Infrastructure monitor: CPU, memory and disk sampling.
//!
//! Stats come from `sysinfo` rather than shelling out, so the monitor works
//! the same on every platform; when the platform reports nothing (e.g. no
//! disk list in a minimal container) values degrade to zero instead of
//! failing. Samples feed the metrics registry and threshold breaches are
//! published for the alerting pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Result;
use crate::kernel::{EventHub, Service};
use crate::monitoring::metrics::MetricsService;

pub const METRICS_TOPIC: &str = "monitor:metrics";
pub const THRESHOLD_TOPIC: &str = "monitor:threshold";

#[derive(Debug, Clone, Copy)]
pub struct ResourceThresholds {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    pub cpu_critical: f64,
    pub memory_critical: f64,
    pub disk_critical: f64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            cpu: 80.0,
            memory: 85.0,
            disk: 90.0,
            cpu_critical: 90.0,
            memory_critical: 95.0,
            disk_critical: 95.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InfrastructureConfig {
    pub collection_interval: std::time::Duration,
    pub thresholds: ResourceThresholds,
}

impl Default for InfrastructureConfig {
    fn default() -> Self {
        Self {
            collection_interval: std::time::Duration::from_secs(10),
            thresholds: ResourceThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DiskStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InfrastructureSnapshot {
    pub cpu_percent: f64,
    pub memory: MemoryStats,
    pub disk: DiskStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreachLevel {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdBreach {
    pub resource: String,
    pub level: BreachLevel,
    pub value: f64,
    pub threshold: f64,
}

pub struct InfrastructureMonitor {
    config: InfrastructureConfig,
    metrics: Arc<MetricsService>,
    hub: EventHub,
    system: Mutex<System>,
}

impl InfrastructureMonitor {
    pub fn new(config: InfrastructureConfig, metrics: Arc<MetricsService>, hub: EventHub) -> Self {
        Self {
            config,
            metrics,
            hub,
            system: Mutex::new(System::new()),
        }
    }

    /// Take one sample. CPU usage is a delta since the previous refresh, so
    /// the very first sample reads 0.
    pub fn sample(&self) -> InfrastructureSnapshot {
        let (cpu_percent, memory) = {
            let mut system = self.system.lock();
            system.refresh_cpu_usage();
            system.refresh_memory();

            let total = system.total_memory();
            let used = system.used_memory();
            let percent = if total > 0 {
                used as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            (
                system.global_cpu_usage() as f64,
                MemoryStats {
                    total_bytes: total,
                    used_bytes: used,
                    free_bytes: total.saturating_sub(used),
                    percent,
                },
            )
        };

        InfrastructureSnapshot {
            cpu_percent,
            memory,
            disk: Self::sample_disk(),
        }
    }

    fn sample_disk() -> DiskStats {
        let disks = Disks::new_with_refreshed_list();
        let root = disks
            .iter()
            .find(|d| d.mount_point() == std::path::Path::new("/"))
            .or_else(|| disks.iter().next());
        match root {
            Some(disk) => {
                let total = disk.total_space();
                let free = disk.available_space();
                let used = total.saturating_sub(free);
                DiskStats {
                    total_bytes: total,
                    used_bytes: used,
                    free_bytes: free,
                    percent: if total > 0 {
                        used as f64 / total as f64 * 100.0
                    } else {
                        0.0
                    },
                }
            }
            // Nothing reported (containerized or restricted): zero values.
            None => DiskStats::default(),
        }
    }

    /// Compare a snapshot against the thresholds.
    pub fn evaluate(&self, snapshot: &InfrastructureSnapshot) -> Vec<ThresholdBreach> {
        let t = &self.config.thresholds;
        let checks = [
            ("cpu", snapshot.cpu_percent, t.cpu, t.cpu_critical),
            ("memory", snapshot.memory.percent, t.memory, t.memory_critical),
            ("disk", snapshot.disk.percent, t.disk, t.disk_critical),
        ];

        let mut breaches = Vec::new();
        for (resource, value, warn, critical) in checks {
            if value >= critical {
                breaches.push(ThresholdBreach {
                    resource: resource.to_string(),
                    level: BreachLevel::Critical,
                    value,
                    threshold: critical,
                });
            } else if value >= warn {
                breaches.push(ThresholdBreach {
                    resource: resource.to_string(),
                    level: BreachLevel::Warning,
                    value,
                    threshold: warn,
                });
            }
        }
        breaches
    }

    async fn collect_once(&self) {
        let snapshot = self.sample();
        self.metrics
            .record_system_usage(snapshot.cpu_percent, snapshot.memory.percent);
        debug!(
            cpu = snapshot.cpu_percent,
            memory = snapshot.memory.percent,
            disk = snapshot.disk.percent,
            "infrastructure sample"
        );
        self.hub.publish_event(METRICS_TOPIC, &snapshot);

        for breach in self.evaluate(&snapshot) {
            self.hub.publish_event(THRESHOLD_TOPIC, &breach);
        }
    }
}

#[async_trait]
impl Service for InfrastructureMonitor {
    fn name(&self) -> &'static str {
        "infrastructure-monitor"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            interval_ms = self.config.collection_interval.as_millis() as u64,
            "infrastructure monitor starting"
        );
        let mut interval = tokio::time::interval(self.config.collection_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.collect_once().await,
            }
        }
        info!("infrastructure monitor stopped");
        Ok(())
    }
}
