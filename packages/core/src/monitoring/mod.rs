//! Observability: the metric registry, the three-tier monitors
//! (infrastructure / application / business), the smart alerting pipeline
//! and aggregated queue health.

pub mod alerts;
pub mod application;
pub mod business;
pub mod infrastructure;
pub mod metrics;
pub mod queue_monitor;

pub use alerts::{
    AlertCondition, AlertEscalation, AlertEvent, AlertRule, AlertSeverity, AlertState,
    ConditionOp, SmartAlertConfig, SmartAlertService, SuppressionStats,
};
pub use application::{ApplicationMonitor, CacheStats, ComponentHealth, EndpointStats};
pub use business::{BusinessMonitor, TaskTypeStats};
pub use infrastructure::{
    BreachLevel, InfrastructureConfig, InfrastructureMonitor, InfrastructureSnapshot,
    ResourceThresholds, ThresholdBreach,
};
pub use metrics::{names, Metric, MetricPoint, MetricType, MetricsConfig, MetricsService};
pub use queue_monitor::{
    QueueHealthReport, QueueHealthStatus, QueueMonitor, QueueMonitorConfig, QueueThresholds,
};
