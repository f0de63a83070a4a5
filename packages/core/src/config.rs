//! Aggregate configuration.
//!
//! Each component keeps its own config struct next to its implementation;
//! `CoreConfig` bundles them for one-stop construction of the whole core.
//! Defaults match the documented configuration surface.

use crate::guardian::GuardianConfig;
use crate::healing::SelfHealingConfig;
use crate::monitoring::{
    InfrastructureConfig, MetricsConfig, QueueMonitorConfig, SmartAlertConfig,
};
use crate::pool::AgentPoolConfig;
use crate::queue::{IdempotencyConfig, QueueConfig};
use crate::scheduler::SchedulerConfig;

#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub scheduler: SchedulerConfig,
    pub queue: QueueConfig,
    pub idempotency: IdempotencyConfig,
    pub pool: AgentPoolConfig,
    pub metrics: MetricsConfig,
    pub infrastructure: InfrastructureConfig,
    pub alerts: SmartAlertConfig,
    pub healing: SelfHealingConfig,
    pub guardian: GuardianConfig,
    pub queue_monitor: QueueMonitorConfig,
    /// Redis connection for the durable store; `None` means the caller
    /// supplies a `KvStore` directly (tests use the in-memory one).
    pub redis_url: Option<String>,
}
