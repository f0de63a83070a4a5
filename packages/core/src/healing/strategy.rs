//! Healing strategies: declarative `(trigger → actions)` bindings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::monitoring::{AlertCondition, AlertSeverity};

/// One remediation step. String payloads are interpreted by the host's
/// command runner / notifier; the core only sequences them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealingAction {
    Command { command: String },
    Script { path: String, args: Vec<String> },
    Restart { target: String },
    Scale { target: String, replicas: u32 },
    Notify { channel: String, message: String },
}

impl HealingAction {
    pub fn describe(&self) -> String {
        match self {
            HealingAction::Command { command } => format!("command: {command}"),
            HealingAction::Script { path, .. } => format!("script: {path}"),
            HealingAction::Restart { target } => format!("restart: {target}"),
            HealingAction::Scale { target, replicas } => {
                format!("scale: {target} -> {replicas}")
            }
            HealingAction::Notify { channel, .. } => format!("notify: {channel}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    pub action: HealingAction,
    /// Retryable actions are re-run up to the service's `max_retries`; a
    /// non-retryable failure stops the whole chain.
    pub retryable: bool,
}

#[derive(Debug, Clone)]
pub struct HealingStrategy {
    pub id: String,
    pub trigger_metric: String,
    /// Minimum event severity that arms this strategy.
    pub trigger_severity: AlertSeverity,
    pub trigger_condition: AlertCondition,
    pub actions: Vec<ActionSpec>,
    pub cooldown: Duration,
    pub enabled: bool,
}

impl HealingStrategy {
    /// Whether this strategy matches an observed `(metric, value, severity)`.
    pub fn matches(&self, metric: &str, value: f64, severity: AlertSeverity) -> bool {
        self.enabled
            && self.trigger_metric == metric
            && severity >= self.trigger_severity
            && self.trigger_condition.matches(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::ConditionOp;

    fn strategy() -> HealingStrategy {
        HealingStrategy {
            id: "cpu-relief".to_string(),
            trigger_metric: "cpu".to_string(),
            trigger_severity: AlertSeverity::Warning,
            trigger_condition: AlertCondition {
                op: ConditionOp::Gt,
                threshold: 80.0,
            },
            actions: vec![],
            cooldown: Duration::from_secs(300),
            enabled: true,
        }
    }

    #[test]
    fn matches_when_all_triggers_align() {
        let s = strategy();
        assert!(s.matches("cpu", 90.0, AlertSeverity::Warning));
        assert!(s.matches("cpu", 90.0, AlertSeverity::Critical));
    }

    #[test]
    fn rejects_lower_severity_or_wrong_metric() {
        let s = strategy();
        assert!(!s.matches("cpu", 90.0, AlertSeverity::Info));
        assert!(!s.matches("memory", 90.0, AlertSeverity::Warning));
        assert!(!s.matches("cpu", 70.0, AlertSeverity::Warning));
    }

    #[test]
    fn disabled_strategy_never_matches() {
        let mut s = strategy();
        s.enabled = false;
        assert!(!s.matches("cpu", 90.0, AlertSeverity::Critical));
    }
}
