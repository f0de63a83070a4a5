//! Aggregated queue health.
//!
//! Rolls queue counters and dead-letter stats into one report with a
//! status, firing alerts and operator recommendations when thresholds are
//! crossed. Runs standalone via `check_health` or periodically as a
//! `Service`, publishing reports on the hub.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::common::Clock;
use crate::error::Result;
use crate::kernel::{EventHub, Service};
use crate::queue::{DeadLetterQueue, DlqStats, JobCounts, QueueService};

pub const QUEUE_HEALTH_TOPIC: &str = "queue-health";

#[derive(Debug, Clone, Copy)]
pub struct QueueThresholds {
    pub waiting: u64,
    pub active: u64,
    pub failed: u64,
    pub dlq_size: u64,
}

impl Default for QueueThresholds {
    fn default() -> Self {
        Self {
            waiting: 1_000,
            active: 100,
            failed: 50,
            dlq_size: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueMonitorConfig {
    pub check_interval: Duration,
    pub thresholds: QueueThresholds,
}

impl Default for QueueMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            thresholds: QueueThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueHealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueHealthReport {
    pub status: QueueHealthStatus,
    pub queues: HashMap<String, JobCounts>,
    pub dlq: DlqStats,
    pub alerts: Vec<String>,
    pub recommendations: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

pub struct QueueMonitor {
    config: QueueMonitorConfig,
    clock: Arc<dyn Clock>,
    hub: EventHub,
    service: Arc<QueueService>,
    dlq: Arc<DeadLetterQueue>,
    queues: Vec<String>,
}

impl QueueMonitor {
    pub fn new(
        config: QueueMonitorConfig,
        clock: Arc<dyn Clock>,
        hub: EventHub,
        service: Arc<QueueService>,
        dlq: Arc<DeadLetterQueue>,
        queues: Vec<String>,
    ) -> Self {
        Self {
            config,
            clock,
            hub,
            service,
            dlq,
            queues,
        }
    }

    pub async fn check_health(&self) -> Result<QueueHealthReport> {
        let thresholds = &self.config.thresholds;
        let mut queues = HashMap::new();
        let mut alerts = Vec::new();
        let mut recommendations = Vec::new();
        let mut status = QueueHealthStatus::Healthy;

        let raise = |status: &mut QueueHealthStatus, critical: bool| {
            if critical {
                *status = QueueHealthStatus::Critical;
            } else if *status == QueueHealthStatus::Healthy {
                *status = QueueHealthStatus::Warning;
            }
        };

        for queue in &self.queues {
            let counts = self.service.get_job_counts(queue).await?;

            if counts.waiting >= thresholds.waiting {
                raise(&mut status, counts.waiting >= thresholds.waiting * 2);
                alerts.push(format!(
                    "{queue}: {} waiting jobs (threshold {})",
                    counts.waiting, thresholds.waiting
                ));
                recommendations
                    .push(format!("{queue}: increase worker concurrency to drain backlog"));
            }
            if counts.active >= thresholds.active {
                raise(&mut status, counts.active >= thresholds.active * 2);
                alerts.push(format!(
                    "{queue}: {} active jobs (threshold {})",
                    counts.active, thresholds.active
                ));
                recommendations.push(format!(
                    "{queue}: check for stuck processors holding jobs active"
                ));
            }
            if counts.failed >= thresholds.failed {
                raise(&mut status, counts.failed >= thresholds.failed * 2);
                alerts.push(format!(
                    "{queue}: {} failed jobs (threshold {})",
                    counts.failed, thresholds.failed
                ));
                recommendations
                    .push(format!("{queue}: inspect recent failures for a common cause"));
            }
            queues.insert(queue.clone(), counts);
        }

        let dlq = self.dlq.get_stats().await?;
        if dlq.total_entries >= thresholds.dlq_size {
            raise(&mut status, dlq.total_entries >= thresholds.dlq_size * 2);
            alerts.push(format!(
                "dead letter queue holds {} entries (threshold {})",
                dlq.total_entries, thresholds.dlq_size
            ));
            recommendations
                .push("triage dead-letter entries; requeue or discard resolved ones".to_string());
        }
        if dlq.pending_manual_intervention > 0 {
            recommendations.push(format!(
                "{} dead-letter entries require manual intervention",
                dlq.pending_manual_intervention
            ));
        }

        let report = QueueHealthReport {
            status,
            queues,
            dlq,
            alerts,
            recommendations,
            checked_at: self.clock.now(),
        };
        if report.status != QueueHealthStatus::Healthy {
            warn!(status = ?report.status, alerts = report.alerts.len(), "queue health degraded");
        }
        Ok(report)
    }

    pub async fn is_healthy(&self) -> bool {
        matches!(
            self.check_health().await.map(|r| r.status),
            Ok(QueueHealthStatus::Healthy)
        )
    }
}

#[async_trait]
impl Service for QueueMonitor {
    fn name(&self) -> &'static str {
        "queue-monitor"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            interval_ms = self.config.check_interval.as_millis() as u64,
            "queue monitor starting"
        );
        let mut interval = tokio::time::interval(self.config.check_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.check_health().await {
                        Ok(report) => self.hub.publish_event(QUEUE_HEALTH_TOPIC, &report),
                        Err(e) => warn!(error = %e, "queue health check failed"),
                    }
                }
            }
        }
        info!("queue monitor stopped");
        Ok(())
    }
}
