//! Self-healing service: strategy selection, action execution, cooldowns.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::common::{new_id, Clock};
use crate::error::Result;
use crate::kernel::{BaseCommandRunner, BaseNotifier, EventHub};
use crate::monitoring::AlertSeverity;

use super::strategy::{ActionSpec, HealingAction, HealingStrategy};

pub const HEALING_TOPIC: &str = "healing";

#[derive(Debug, Clone)]
pub struct SelfHealingConfig {
    pub enable_auto_healing: bool,
    /// Retries per retryable action.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub action_timeout: Duration,
    pub history_limit: usize,
}

impl Default for SelfHealingConfig {
    fn default() -> Self {
        Self {
            enable_auto_healing: true,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            action_timeout: Duration::from_secs(30),
            history_limit: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionResult {
    pub description: String,
    pub attempts: u32,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealingRecord {
    pub id: Uuid,
    pub strategy_id: String,
    pub metric: String,
    pub value: f64,
    pub severity: AlertSeverity,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub actions: Vec<ActionResult>,
}

/// What `check_and_heal` did.
#[derive(Debug, Clone, Serialize)]
pub struct HealingOutcome {
    pub triggered: bool,
    pub strategy_id: Option<String>,
    pub actions_executed: u32,
    pub success: bool,
}

impl HealingOutcome {
    fn untriggered() -> Self {
        Self {
            triggered: false,
            strategy_id: None,
            actions_executed: 0,
            success: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HealingStats {
    pub total_executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub by_strategy: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum HealingEvent {
    HealingStarted {
        strategy_id: String,
        metric: String,
        value: f64,
    },
    HealingCompleted {
        strategy_id: String,
        success: bool,
        actions_executed: u32,
    },
    Notification {
        strategy_id: String,
        message: String,
    },
}

pub struct SelfHealingService {
    config: SelfHealingConfig,
    clock: Arc<dyn Clock>,
    hub: EventHub,
    command_runner: Arc<dyn BaseCommandRunner>,
    notifier: Arc<dyn BaseNotifier>,
    strategies: RwLock<Vec<HealingStrategy>>,
    cooldowns: Mutex<HashMap<String, DateTime<Utc>>>,
    history: Mutex<VecDeque<HealingRecord>>,
    stats: Mutex<HealingStats>,
}

impl SelfHealingService {
    pub fn new(
        config: SelfHealingConfig,
        clock: Arc<dyn Clock>,
        hub: EventHub,
        command_runner: Arc<dyn BaseCommandRunner>,
        notifier: Arc<dyn BaseNotifier>,
    ) -> Self {
        Self {
            config,
            clock,
            hub,
            command_runner,
            notifier,
            strategies: RwLock::new(Vec::new()),
            cooldowns: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            stats: Mutex::new(HealingStats::default()),
        }
    }

    /// Strategies are consulted in registration order; the first match wins.
    pub fn register_strategy(&self, strategy: HealingStrategy) {
        self.strategies.write().push(strategy);
    }

    pub fn remove_strategy(&self, id: &str) -> bool {
        let mut strategies = self.strategies.write();
        let before = strategies.len();
        strategies.retain(|s| s.id != id);
        strategies.len() != before
    }

    pub fn list_strategies(&self) -> Vec<String> {
        self.strategies.read().iter().map(|s| s.id.clone()).collect()
    }

    fn in_cooldown(&self, strategy: &HealingStrategy, now: DateTime<Utc>) -> bool {
        let cooldowns = self.cooldowns.lock();
        match cooldowns.get(&strategy.id) {
            Some(last) => {
                let cooldown = chrono::Duration::from_std(strategy.cooldown)
                    .unwrap_or_else(|_| chrono::Duration::seconds(300));
                now - *last < cooldown
            }
            None => false,
        }
    }

    /// React to an observed `(metric, value, severity)` event. Selects the
    /// first enabled, matching, non-cooled-down strategy and runs its
    /// actions in order.
    pub async fn check_and_heal(
        &self,
        metric: &str,
        value: f64,
        severity: AlertSeverity,
    ) -> Result<HealingOutcome> {
        if !self.config.enable_auto_healing {
            return Ok(HealingOutcome::untriggered());
        }

        let now = self.clock.now();
        let strategy = {
            let strategies = self.strategies.read();
            strategies
                .iter()
                .find(|s| s.matches(metric, value, severity) && !self.in_cooldown(s, now))
                .cloned()
        };
        let Some(strategy) = strategy else {
            return Ok(HealingOutcome::untriggered());
        };

        info!(strategy_id = %strategy.id, metric, value, "healing started");
        self.hub.publish_event(
            HEALING_TOPIC,
            &HealingEvent::HealingStarted {
                strategy_id: strategy.id.clone(),
                metric: metric.to_string(),
                value,
            },
        );

        let started_at = self.clock.now();
        let mut actions = Vec::new();
        let mut chain_success = true;
        for spec in &strategy.actions {
            let result = self.execute_action(&strategy.id, spec).await;
            let stop = !result.success && !spec.retryable;
            let failed = !result.success;
            actions.push(result);
            if failed {
                chain_success = false;
            }
            if stop {
                warn!(strategy_id = %strategy.id, "non-retryable action failed, stopping chain");
                break;
            }
        }

        // Cooldown starts when the strategy fires, success or not.
        self.cooldowns.lock().insert(strategy.id.clone(), now);

        let record = HealingRecord {
            id: new_id(),
            strategy_id: strategy.id.clone(),
            metric: metric.to_string(),
            value,
            severity,
            started_at,
            finished_at: self.clock.now(),
            success: chain_success,
            actions: actions.clone(),
        };
        {
            let mut history = self.history.lock();
            history.push_back(record);
            while history.len() > self.config.history_limit {
                history.pop_front();
            }
        }
        {
            let mut stats = self.stats.lock();
            stats.total_executions += 1;
            if chain_success {
                stats.successes += 1;
            } else {
                stats.failures += 1;
            }
            *stats.by_strategy.entry(strategy.id.clone()).or_insert(0) += 1;
        }

        self.hub.publish_event(
            HEALING_TOPIC,
            &HealingEvent::HealingCompleted {
                strategy_id: strategy.id.clone(),
                success: chain_success,
                actions_executed: actions.len() as u32,
            },
        );

        Ok(HealingOutcome {
            triggered: true,
            strategy_id: Some(strategy.id),
            actions_executed: actions.len() as u32,
            success: chain_success,
        })
    }

    async fn execute_action(&self, strategy_id: &str, spec: &ActionSpec) -> ActionResult {
        let max_attempts = if spec.retryable {
            self.config.max_retries.max(1)
        } else {
            1
        };

        let mut attempts = 0;
        let mut last_error = None;
        while attempts < max_attempts {
            attempts += 1;
            match self.run_once(strategy_id, &spec.action).await {
                Ok(()) => {
                    return ActionResult {
                        description: spec.action.describe(),
                        attempts,
                        success: true,
                        error: None,
                    }
                }
                Err(error) => {
                    warn!(
                        strategy_id,
                        action = %spec.action.describe(),
                        attempt = attempts,
                        error = %error,
                        "healing action failed"
                    );
                    last_error = Some(error.to_string());
                    if attempts < max_attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        ActionResult {
            description: spec.action.describe(),
            attempts,
            success: false,
            error: last_error,
        }
    }

    async fn run_once(&self, strategy_id: &str, action: &HealingAction) -> Result<()> {
        let timeout = self.config.action_timeout;
        match action {
            HealingAction::Command { command } => {
                let output = self.command_runner.run(command, timeout).await?;
                if output.success() {
                    Ok(())
                } else {
                    Err(crate::error::CoreError::execution(format!(
                        "command exited {}: {}",
                        output.status, output.stderr
                    )))
                }
            }
            HealingAction::Script { path, args } => {
                let command = if args.is_empty() {
                    path.clone()
                } else {
                    format!("{path} {}", args.join(" "))
                };
                let output = self.command_runner.run(&command, timeout).await?;
                if output.success() {
                    Ok(())
                } else {
                    Err(crate::error::CoreError::execution(format!(
                        "script exited {}: {}",
                        output.status, output.stderr
                    )))
                }
            }
            HealingAction::Restart { target } => {
                let output = self
                    .command_runner
                    .run(&format!("systemctl restart {target}"), timeout)
                    .await?;
                if output.success() {
                    Ok(())
                } else {
                    Err(crate::error::CoreError::execution(format!(
                        "restart of {target} exited {}",
                        output.status
                    )))
                }
            }
            HealingAction::Scale { target, replicas } => {
                let output = self
                    .command_runner
                    .run(&format!("scale {target} {replicas}"), timeout)
                    .await?;
                if output.success() {
                    Ok(())
                } else {
                    Err(crate::error::CoreError::execution(format!(
                        "scale of {target} exited {}",
                        output.status
                    )))
                }
            }
            HealingAction::Notify { channel, message } => {
                self.notifier
                    .notify(channel, "self-healing", message)
                    .await?;
                self.hub.publish_event(
                    HEALING_TOPIC,
                    &HealingEvent::Notification {
                        strategy_id: strategy_id.to_string(),
                        message: message.clone(),
                    },
                );
                Ok(())
            }
        }
    }

    pub fn get_stats(&self) -> HealingStats {
        self.stats.lock().clone()
    }

    pub fn get_history(&self, limit: usize) -> Vec<HealingRecord> {
        let history = self.history.lock();
        history.iter().rev().take(limit).cloned().collect()
    }
}
