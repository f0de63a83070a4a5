//! Smart alerting: suppression, escalation and routing.
//!
//! Metric samples are evaluated against declarative rules. Fired events run
//! through a three-stage pipeline:
//!
//! 1. **Suppression**: a repeat alert for the same `(rule, metric)` inside
//!    the suppression window is dropped (and counted).
//! 2. **Escalation**: enough consecutive emitted alerts for one rule bump
//!    the severity one rung and emit an escalation notice.
//! 3. **Routing**: the final severity picks a channel; channel handlers
//!    and rule-specific handlers fire, history and stats are recorded.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::common::{new_id, Clock};
use crate::error::{CoreError, Result};
use crate::kernel::EventHub;

pub const ALERT_TOPIC: &str = "alerts";
pub const ESCALATION_TOPIC: &str = "alerts:escalation";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    /// One rung up; CRITICAL saturates.
    pub fn escalated(self) -> AlertSeverity {
        match self {
            AlertSeverity::Info => AlertSeverity::Warning,
            AlertSeverity::Warning => AlertSeverity::Error,
            AlertSeverity::Error | AlertSeverity::Critical => AlertSeverity::Critical,
        }
    }

    pub fn channel(self) -> &'static str {
        match self {
            AlertSeverity::Info => "info-channel",
            AlertSeverity::Warning => "warning-channel",
            AlertSeverity::Error => "error-channel",
            AlertSeverity::Critical => "critical-channel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Gt,
    Lt,
    Eq,
    Gte,
    Lte,
    Ne,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AlertCondition {
    pub op: ConditionOp,
    pub threshold: f64,
}

impl AlertCondition {
    pub fn matches(&self, value: f64) -> bool {
        match self.op {
            ConditionOp::Gt => value > self.threshold,
            ConditionOp::Lt => value < self.threshold,
            ConditionOp::Eq => value == self.threshold,
            ConditionOp::Gte => value >= self.threshold,
            ConditionOp::Lte => value <= self.threshold,
            ConditionOp::Ne => value != self.threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub metric_name: String,
    pub condition: AlertCondition,
    pub severity: AlertSeverity,
    pub enabled: bool,
    /// Per-rule cooldown between firings, on top of global suppression.
    pub cooldown_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertState {
    #[default]
    Active,
    Acknowledged,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: Uuid,
    pub rule_id: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub metric_name: String,
    pub value: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
    pub state: AlertState,
    pub tags: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEscalation {
    pub rule_id: String,
    pub from: AlertSeverity,
    pub to: AlertSeverity,
    pub consecutive: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SmartAlertConfig {
    pub suppression_window: Duration,
    pub escalation_threshold: u32,
    pub escalation_interval: Duration,
    pub history_limit: usize,
}

impl Default for SmartAlertConfig {
    fn default() -> Self {
        Self {
            suppression_window: Duration::from_secs(60),
            escalation_threshold: 3,
            escalation_interval: Duration::from_secs(300),
            history_limit: 1_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SuppressionStats {
    pub suppressed_count: u64,
    pub by_rule: HashMap<String, u64>,
}

type AlertHandler = Box<dyn Fn(&AlertEvent) + Send + Sync>;

#[derive(Default)]
struct EscalationState {
    consecutive: u32,
    last_emitted: Option<DateTime<Utc>>,
}

pub struct SmartAlertService {
    config: SmartAlertConfig,
    clock: Arc<dyn Clock>,
    hub: EventHub,
    rules: RwLock<HashMap<String, AlertRule>>,
    /// Last emission per `(rule, metric)` for suppression.
    last_emitted: Mutex<HashMap<(String, String), DateTime<Utc>>>,
    escalation: Mutex<HashMap<String, EscalationState>>,
    history: Mutex<VecDeque<AlertEvent>>,
    active: Mutex<HashMap<Uuid, AlertEvent>>,
    suppression: Mutex<SuppressionStats>,
    severity_counts: Mutex<HashMap<AlertSeverity, u64>>,
    channel_handlers: Mutex<HashMap<String, Vec<AlertHandler>>>,
    rule_handlers: Mutex<HashMap<String, Vec<AlertHandler>>>,
}

impl SmartAlertService {
    pub fn new(config: SmartAlertConfig, clock: Arc<dyn Clock>, hub: EventHub) -> Self {
        Self {
            config,
            clock,
            hub,
            rules: RwLock::new(HashMap::new()),
            last_emitted: Mutex::new(HashMap::new()),
            escalation: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            active: Mutex::new(HashMap::new()),
            suppression: Mutex::new(SuppressionStats::default()),
            severity_counts: Mutex::new(HashMap::new()),
            channel_handlers: Mutex::new(HashMap::new()),
            rule_handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults(clock: Arc<dyn Clock>, hub: EventHub) -> Self {
        Self::new(SmartAlertConfig::default(), clock, hub)
    }

    // Rules -------------------------------------------------------------

    pub fn add_rule(&self, rule: AlertRule) {
        self.rules.write().insert(rule.id.clone(), rule);
    }

    pub fn remove_rule(&self, rule_id: &str) -> bool {
        self.rules.write().remove(rule_id).is_some()
    }

    pub fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> Result<()> {
        let mut rules = self.rules.write();
        let rule = rules
            .get_mut(rule_id)
            .ok_or_else(|| CoreError::NotFound(format!("alert rule {rule_id}")))?;
        rule.enabled = enabled;
        Ok(())
    }

    pub fn get_rule(&self, rule_id: &str) -> Option<AlertRule> {
        self.rules.read().get(rule_id).cloned()
    }

    // Handlers ----------------------------------------------------------

    /// Handler for a routing channel (`critical-channel` etc).
    pub fn on_channel<F>(&self, channel: &str, handler: F)
    where
        F: Fn(&AlertEvent) + Send + Sync + 'static,
    {
        self.channel_handlers
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(Box::new(handler));
    }

    /// Handler invoked for a specific rule, regardless of severity.
    pub fn on_rule<F>(&self, rule_id: &str, handler: F)
    where
        F: Fn(&AlertEvent) + Send + Sync + 'static,
    {
        self.rule_handlers
            .lock()
            .entry(rule_id.to_string())
            .or_default()
            .push(Box::new(handler));
    }

    // Evaluation & processing -------------------------------------------

    /// Evaluate one metric sample against every enabled rule; returns the
    /// alerts that were actually emitted (not suppressed).
    pub async fn evaluate_metric(
        &self,
        metric_name: &str,
        value: f64,
        tags: Option<HashMap<String, String>>,
    ) -> Vec<AlertEvent> {
        let matching: Vec<AlertRule> = {
            let rules = self.rules.read();
            rules
                .values()
                .filter(|r| r.enabled && r.metric_name == metric_name && r.condition.matches(value))
                .cloned()
                .collect()
        };

        let mut emitted = Vec::new();
        for rule in matching {
            let event = AlertEvent {
                id: new_id(),
                rule_id: rule.id.clone(),
                severity: rule.severity,
                message: format!(
                    "{metric_name} is {value} (threshold {})",
                    rule.condition.threshold
                ),
                metric_name: metric_name.to_string(),
                value,
                threshold: rule.condition.threshold,
                timestamp: self.clock.now(),
                state: AlertState::Active,
                tags: tags.clone(),
            };
            if let Some(event) = self.process_alert(event).await {
                emitted.push(event);
            }
        }
        emitted
    }

    /// Run one alert through suppression → escalation → routing. Returns
    /// the emitted event, or `None` when suppressed.
    pub async fn process_alert(&self, mut event: AlertEvent) -> Option<AlertEvent> {
        let now = self.clock.now();
        let suppression_key = (event.rule_id.clone(), event.metric_name.clone());

        // 1. Suppression. The effective window is the global suppression
        // window or the rule's own cooldown, whichever is longer.
        {
            let rule_cooldown_ms = self
                .rules
                .read()
                .get(&event.rule_id)
                .map(|r| r.cooldown_ms)
                .unwrap_or(0);
            let window_ms =
                (self.config.suppression_window.as_millis() as u64).max(rule_cooldown_ms);
            let window = chrono::Duration::milliseconds(window_ms as i64);
            let mut last = self.last_emitted.lock();
            if let Some(previous) = last.get(&suppression_key) {
                if now - *previous < window {
                    let mut stats = self.suppression.lock();
                    stats.suppressed_count += 1;
                    *stats.by_rule.entry(event.rule_id.clone()).or_insert(0) += 1;
                    debug!(rule_id = %event.rule_id, metric = %event.metric_name, "alert suppressed");
                    return None;
                }
            }
            last.insert(suppression_key, now);
        }

        // 2. Escalation.
        let escalation = {
            let mut states = self.escalation.lock();
            let state = states.entry(event.rule_id.clone()).or_default();

            // A long quiet period resets the consecutive counter.
            let interval = chrono::Duration::from_std(self.config.escalation_interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
            if let Some(last) = state.last_emitted {
                if now - last > interval {
                    state.consecutive = 0;
                }
            }
            state.consecutive += 1;
            state.last_emitted = Some(now);

            if state.consecutive >= self.config.escalation_threshold {
                let from = event.severity;
                let to = from.escalated();
                state.consecutive = 0;
                Some(AlertEscalation {
                    rule_id: event.rule_id.clone(),
                    from,
                    to,
                    consecutive: self.config.escalation_threshold,
                    timestamp: now,
                })
            } else {
                None
            }
        };
        if let Some(escalation) = &escalation {
            info!(
                rule_id = %escalation.rule_id,
                from = ?escalation.from,
                to = ?escalation.to,
                "alert escalated"
            );
            event.severity = escalation.to;
            self.hub.publish_event(ESCALATION_TOPIC, escalation);
        }

        // 3. Routing.
        {
            let channel = event.severity.channel();
            let handlers = self.channel_handlers.lock();
            if let Some(list) = handlers.get(channel) {
                for handler in list {
                    handler(&event);
                }
            }
        }
        {
            let handlers = self.rule_handlers.lock();
            if let Some(list) = handlers.get(&event.rule_id) {
                for handler in list {
                    handler(&event);
                }
            }
        }

        *self
            .severity_counts
            .lock()
            .entry(event.severity)
            .or_insert(0) += 1;
        {
            let mut history = self.history.lock();
            history.push_back(event.clone());
            while history.len() > self.config.history_limit {
                history.pop_front();
            }
        }
        self.active.lock().insert(event.id, event.clone());
        self.hub.publish_event(ALERT_TOPIC, &event);
        Some(event)
    }

    // Lifecycle ---------------------------------------------------------

    pub fn acknowledge(&self, alert_id: Uuid) -> Result<()> {
        let mut active = self.active.lock();
        let alert = active
            .get_mut(&alert_id)
            .ok_or_else(|| CoreError::NotFound(format!("alert {alert_id}")))?;
        if alert.state == AlertState::Active {
            alert.state = AlertState::Acknowledged;
        }
        Ok(())
    }

    pub fn resolve(&self, alert_id: Uuid) -> Result<()> {
        let mut active = self.active.lock();
        let mut alert = active
            .remove(&alert_id)
            .ok_or_else(|| CoreError::NotFound(format!("alert {alert_id}")))?;
        alert.state = AlertState::Resolved;
        Ok(())
    }

    pub fn active_alerts(&self) -> Vec<AlertEvent> {
        self.active.lock().values().cloned().collect()
    }

    // Stats -------------------------------------------------------------

    pub fn get_suppression_stats(&self) -> SuppressionStats {
        self.suppression.lock().clone()
    }

    pub fn get_severity_stats(&self) -> HashMap<AlertSeverity, u64> {
        self.severity_counts.lock().clone()
    }

    pub fn get_history(&self, limit: usize) -> Vec<AlertEvent> {
        let history = self.history.lock();
        history.iter().rev().take(limit).cloned().collect()
    }
}
