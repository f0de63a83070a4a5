//! Agent pool: registration, matching and assignment.
//!
//! Agents register with a type, a capability set and an executor. Tasks are
//! matched to an agent by the configured strategy and executed under the
//! pool timeout. Double assignment is impossible: the IDLE→BUSY transition
//! happens inside the registry write lock, so of two racing assignments one
//! sees the agent already BUSY.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::common::{new_id, Clock};
use crate::error::{CoreError, Result};
use crate::kernel::EventHub;

use super::agent::{Agent, AgentStatus, AgentType, CompletedTask};

pub const POOL_TOPIC: &str = "agent-pool";

/// Work executor implemented by concrete agents.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, input: Value) -> Result<Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentStrategy {
    RoundRobin,
    LeastLoaded,
    #[default]
    CapabilityMatch,
    Random,
}

#[derive(Debug, Clone)]
pub struct AgentPoolConfig {
    pub max_concurrent_tasks_per_agent: usize,
    pub task_timeout: Duration,
    pub enable_auto_assignment: bool,
    /// When no agent of the matched type is idle, fall back to any idle
    /// agent pool-wide.
    pub fallback_enabled: bool,
    pub strategy: AssignmentStrategy,
    /// Completed-task history kept per agent.
    pub history_limit: usize,
}

impl Default for AgentPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks_per_agent: 1,
            task_timeout: Duration::from_secs(300),
            enable_auto_assignment: true,
            fallback_enabled: true,
            strategy: AssignmentStrategy::CapabilityMatch,
            history_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PoolEvent {
    #[serde(rename = "AGENT_REGISTERED")]
    AgentRegistered { agent_id: String, agent_type: AgentType },
    #[serde(rename = "AGENT_UNREGISTERED")]
    AgentUnregistered { agent_id: String },
    #[serde(rename = "TASK_ASSIGNED")]
    TaskAssigned {
        agent_id: String,
        task_id: Uuid,
        task_type: String,
    },
    #[serde(rename = "TASK_COMPLETED")]
    TaskCompleted {
        agent_id: String,
        task_id: Uuid,
        duration_ms: u64,
    },
    #[serde(rename = "TASK_FAILED")]
    TaskFailed {
        agent_id: String,
        task_id: Uuid,
        error: String,
    },
    #[serde(rename = "AGENT_STATUS_CHANGED")]
    AgentStatusChanged {
        agent_id: String,
        from: AgentStatus,
        to: AgentStatus,
    },
}

type PoolListener = Box<dyn Fn(&PoolEvent) + Send + Sync>;

struct AgentEntry {
    meta: Agent,
    executor: Arc<dyn AgentExecutor>,
}

pub struct AgentPool {
    config: AgentPoolConfig,
    clock: Arc<dyn Clock>,
    hub: EventHub,
    /// Insertion order is meaningful: round-robin picks the first idle
    /// agent in registration order.
    agents: RwLock<Vec<AgentEntry>>,
    listeners: parking_lot::Mutex<Vec<PoolListener>>,
}

impl AgentPool {
    pub fn new(config: AgentPoolConfig, clock: Arc<dyn Clock>, hub: EventHub) -> Self {
        Self {
            config,
            clock,
            hub,
            agents: RwLock::new(Vec::new()),
            listeners: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn on_event<F>(&self, listener: F)
    where
        F: Fn(&PoolEvent) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Box::new(listener));
    }

    async fn emit(&self, event: PoolEvent) {
        for listener in self.listeners.lock().iter() {
            listener(&event);
        }
        self.hub.publish_event(POOL_TOPIC, &event);
    }

    // Registration ------------------------------------------------------

    pub async fn register_agent(
        &self,
        id: impl Into<String>,
        agent_type: AgentType,
        capabilities: impl IntoIterator<Item = String>,
        executor: Arc<dyn AgentExecutor>,
    ) -> Result<()> {
        let id = id.into();
        {
            let mut agents = self.agents.write().await;
            if agents.iter().any(|a| a.meta.id == id) {
                return Err(CoreError::Validation(format!(
                    "agent {id} is already registered"
                )));
            }
            agents.push(AgentEntry {
                meta: Agent {
                    id: id.clone(),
                    agent_type,
                    status: AgentStatus::Idle,
                    capabilities: capabilities.into_iter().collect::<HashSet<_>>(),
                    current_task: None,
                    completed_tasks: Vec::new(),
                    registered_at: self.clock.now(),
                },
                executor,
            });
        }
        info!(agent_id = %id, agent_type = ?agent_type, "agent registered");
        self.emit(PoolEvent::AgentRegistered {
            agent_id: id,
            agent_type,
        })
        .await;
        Ok(())
    }

    pub async fn unregister_agent(&self, id: &str) -> Result<()> {
        {
            let mut agents = self.agents.write().await;
            let before = agents.len();
            agents.retain(|a| a.meta.id != id);
            if agents.len() == before {
                return Err(CoreError::NotFound(format!("agent {id}")));
            }
        }
        self.emit(PoolEvent::AgentUnregistered {
            agent_id: id.to_string(),
        })
        .await;
        Ok(())
    }

    pub async fn get_agent(&self, id: &str) -> Option<Agent> {
        self.agents
            .read()
            .await
            .iter()
            .find(|a| a.meta.id == id)
            .map(|a| a.meta.clone())
    }

    pub async fn list_agents(&self) -> Vec<Agent> {
        self.agents.read().await.iter().map(|a| a.meta.clone()).collect()
    }

    /// `(idle, busy)` counts, used by the metrics recorders.
    pub async fn agent_counts(&self) -> (u64, u64) {
        let agents = self.agents.read().await;
        let idle = agents
            .iter()
            .filter(|a| a.meta.status == AgentStatus::Idle)
            .count() as u64;
        let busy = agents
            .iter()
            .filter(|a| a.meta.status == AgentStatus::Busy)
            .count() as u64;
        (idle, busy)
    }

    /// Recover an agent from ERROR back to IDLE.
    pub async fn reset_agent(&self, id: &str) -> Result<()> {
        let changed = {
            let mut agents = self.agents.write().await;
            let entry = agents
                .iter_mut()
                .find(|a| a.meta.id == id)
                .ok_or_else(|| CoreError::NotFound(format!("agent {id}")))?;
            if entry.meta.status == AgentStatus::Error {
                entry.meta.status = AgentStatus::Idle;
                entry.meta.current_task = None;
                true
            } else {
                false
            }
        };
        if changed {
            self.emit(PoolEvent::AgentStatusChanged {
                agent_id: id.to_string(),
                from: AgentStatus::Error,
                to: AgentStatus::Idle,
            })
            .await;
        }
        Ok(())
    }

    // Matching ----------------------------------------------------------

    /// Find an idle agent for `task_type` per the configured strategy.
    /// Returns the agent id.
    pub async fn find_available_agent(
        &self,
        task_type: &str,
        preferred_type: Option<AgentType>,
    ) -> Option<String> {
        let agents = self.agents.read().await;

        let candidate_types: Vec<AgentType> = match preferred_type {
            Some(t) => vec![t],
            None => match AgentType::for_task_type(task_type) {
                Some(t) => vec![t],
                None => AgentType::ALL.to_vec(),
            },
        };

        for candidate_type in &candidate_types {
            let idle: Vec<&AgentEntry> = agents
                .iter()
                .filter(|a| {
                    a.meta.agent_type == *candidate_type && a.meta.status == AgentStatus::Idle
                })
                .collect();
            if idle.is_empty() {
                continue;
            }
            let picked = match self.config.strategy {
                AssignmentStrategy::CapabilityMatch => idle
                    .iter()
                    .find(|a| a.meta.can_handle(task_type))
                    .or_else(|| idle.first())
                    .copied(),
                AssignmentStrategy::LeastLoaded => idle
                    .iter()
                    .min_by_key(|a| a.meta.completed_tasks.len())
                    .copied(),
                AssignmentStrategy::RoundRobin => idle.first().copied(),
                AssignmentStrategy::Random => {
                    idle.choose(&mut rand::thread_rng()).copied()
                }
            };
            if let Some(entry) = picked {
                return Some(entry.meta.id.clone());
            }
        }

        if self.config.fallback_enabled {
            return agents
                .iter()
                .find(|a| a.meta.status == AgentStatus::Idle)
                .map(|a| a.meta.id.clone());
        }
        None
    }

    // Assignment --------------------------------------------------------

    /// Assign `input` to an agent matching `task_type` and run it to
    /// completion under the pool timeout.
    pub async fn assign_task(
        &self,
        task_type: &str,
        input: Value,
        preferred_agent_id: Option<&str>,
    ) -> Result<Value> {
        let agent_id = match preferred_agent_id {
            Some(id) if self.is_idle(id).await => id.to_string(),
            _ => self
                .find_available_agent(task_type, None)
                .await
                .ok_or_else(|| CoreError::AgentUnavailable(task_type.to_string()))?,
        };

        let task_id = new_id();
        let executor = self.claim(&agent_id, task_id).await?;
        self.emit(PoolEvent::AgentStatusChanged {
            agent_id: agent_id.clone(),
            from: AgentStatus::Idle,
            to: AgentStatus::Busy,
        })
        .await;
        self.emit(PoolEvent::TaskAssigned {
            agent_id: agent_id.clone(),
            task_id,
            task_type: task_type.to_string(),
        })
        .await;
        debug!(agent_id = %agent_id, task_id = %task_id, task_type, "task assigned");

        let started = self.clock.now();
        let outcome = tokio::time::timeout(self.config.task_timeout, executor.execute(input)).await;
        let duration_ms = (self.clock.now() - started).num_milliseconds().max(0) as u64;

        match outcome {
            Ok(Ok(result)) => {
                self.release(&agent_id, task_id, task_type, true, duration_ms)
                    .await;
                self.emit(PoolEvent::TaskCompleted {
                    agent_id: agent_id.clone(),
                    task_id,
                    duration_ms,
                })
                .await;
                self.emit(PoolEvent::AgentStatusChanged {
                    agent_id,
                    from: AgentStatus::Busy,
                    to: AgentStatus::Idle,
                })
                .await;
                Ok(result)
            }
            Ok(Err(error)) => {
                self.fail_and_reset(&agent_id, task_id, task_type, duration_ms, &error.to_string())
                    .await;
                Err(error)
            }
            Err(_elapsed) => {
                let error = CoreError::Timeout(self.config.task_timeout.as_millis() as u64);
                self.fail_and_reset(&agent_id, task_id, task_type, duration_ms, &error.to_string())
                    .await;
                Err(error)
            }
        }
    }

    async fn is_idle(&self, id: &str) -> bool {
        self.agents
            .read()
            .await
            .iter()
            .any(|a| a.meta.id == id && a.meta.status == AgentStatus::Idle)
    }

    /// Compare-and-swap IDLE→BUSY under the write lock; returns the
    /// executor on success.
    async fn claim(&self, agent_id: &str, task_id: Uuid) -> Result<Arc<dyn AgentExecutor>> {
        let mut agents = self.agents.write().await;
        let entry = agents
            .iter_mut()
            .find(|a| a.meta.id == agent_id)
            .ok_or_else(|| CoreError::NotFound(format!("agent {agent_id}")))?;
        if entry.meta.status != AgentStatus::Idle {
            return Err(CoreError::AgentUnavailable(agent_id.to_string()));
        }
        entry.meta.status = AgentStatus::Busy;
        entry.meta.current_task = Some(task_id);
        Ok(entry.executor.clone())
    }

    async fn release(
        &self,
        agent_id: &str,
        task_id: Uuid,
        task_type: &str,
        success: bool,
        duration_ms: u64,
    ) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.iter_mut().find(|a| a.meta.id == agent_id) {
            entry.meta.status = AgentStatus::Idle;
            entry.meta.current_task = None;
            entry.meta.completed_tasks.push(CompletedTask {
                task_id,
                task_type: task_type.to_string(),
                success,
                duration_ms,
                finished_at: self.clock.now(),
            });
            let limit = self.config.history_limit;
            if entry.meta.completed_tasks.len() > limit {
                let excess = entry.meta.completed_tasks.len() - limit;
                entry.meta.completed_tasks.drain(0..excess);
            }
        }
    }

    /// Failure path: BUSY→ERROR→IDLE, history records the failure.
    async fn fail_and_reset(
        &self,
        agent_id: &str,
        task_id: Uuid,
        task_type: &str,
        duration_ms: u64,
        error: &str,
    ) {
        warn!(agent_id = %agent_id, task_id = %task_id, error, "agent task failed");
        {
            let mut agents = self.agents.write().await;
            if let Some(entry) = agents.iter_mut().find(|a| a.meta.id == agent_id) {
                entry.meta.status = AgentStatus::Error;
            }
        }
        self.emit(PoolEvent::TaskFailed {
            agent_id: agent_id.to_string(),
            task_id,
            error: error.to_string(),
        })
        .await;
        self.emit(PoolEvent::AgentStatusChanged {
            agent_id: agent_id.to_string(),
            from: AgentStatus::Busy,
            to: AgentStatus::Error,
        })
        .await;

        self.release(agent_id, task_id, task_type, false, duration_ms)
            .await;
        self.emit(PoolEvent::AgentStatusChanged {
            agent_id: agent_id.to_string(),
            from: AgentStatus::Error,
            to: AgentStatus::Idle,
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SystemClock;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct EchoAgent;

    #[async_trait]
    impl AgentExecutor for EchoAgent {
        async fn execute(&self, input: Value) -> Result<Value> {
            Ok(json!({"echo": input}))
        }
    }

    struct FailingAgent;

    #[async_trait]
    impl AgentExecutor for FailingAgent {
        async fn execute(&self, _input: Value) -> Result<Value> {
            Err(CoreError::execution("agent blew up"))
        }
    }

    struct SlowAgent;

    #[async_trait]
    impl AgentExecutor for SlowAgent {
        async fn execute(&self, _input: Value) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }
    }

    fn pool_with(config: AgentPoolConfig) -> AgentPool {
        AgentPool::new(config, Arc::new(SystemClock::new()), EventHub::new())
    }

    fn pool() -> AgentPool {
        pool_with(AgentPoolConfig::default())
    }

    async fn register(pool: &AgentPool, id: &str, agent_type: AgentType, caps: &[&str]) {
        pool.register_agent(
            id,
            agent_type,
            caps.iter().map(|s| s.to_string()),
            Arc::new(EchoAgent),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let pool = pool();
        register(&pool, "dev-1", AgentType::FullStackDeveloper, &[]).await;
        let err = pool
            .register_agent("dev-1", AgentType::FullStackDeveloper, [], Arc::new(EchoAgent))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn find_prefers_mapped_agent_type() {
        let pool = pool();
        register(&pool, "pm-1", AgentType::ProjectManager, &["plan"]).await;
        register(&pool, "dev-1", AgentType::FullStackDeveloper, &["implement"]).await;

        let picked = pool.find_available_agent("implement", None).await.unwrap();
        assert_eq!(picked, "dev-1");
        let picked = pool.find_available_agent("plan", None).await.unwrap();
        assert_eq!(picked, "pm-1");
    }

    #[tokio::test]
    async fn preferred_type_overrides_mapping() {
        let pool = pool();
        register(&pool, "pm-1", AgentType::ProjectManager, &[]).await;
        register(&pool, "qa-1", AgentType::QaEngineer, &[]).await;

        let picked = pool
            .find_available_agent("implement", Some(AgentType::QaEngineer))
            .await
            .unwrap();
        assert_eq!(picked, "qa-1");
    }

    #[tokio::test]
    async fn capability_match_prefers_capable_agent() {
        let pool = pool();
        register(&pool, "qa-generic", AgentType::QaEngineer, &[]).await;
        register(&pool, "qa-review", AgentType::QaEngineer, &["review"]).await;

        let picked = pool.find_available_agent("review", None).await.unwrap();
        assert_eq!(picked, "qa-review");
    }

    #[tokio::test]
    async fn least_loaded_picks_smallest_history() {
        let pool = pool_with(AgentPoolConfig {
            strategy: AssignmentStrategy::LeastLoaded,
            ..Default::default()
        });
        register(&pool, "dev-1", AgentType::FullStackDeveloper, &[]).await;
        register(&pool, "dev-2", AgentType::FullStackDeveloper, &[]).await;

        // Load dev-1 with one completed task.
        pool.assign_task("implement", json!({}), Some("dev-1"))
            .await
            .unwrap();

        let picked = pool.find_available_agent("implement", None).await.unwrap();
        assert_eq!(picked, "dev-2");
    }

    #[tokio::test]
    async fn fallback_uses_any_idle_agent() {
        let pool = pool();
        register(&pool, "pm-1", AgentType::ProjectManager, &[]).await;
        let picked = pool.find_available_agent("implement", None).await.unwrap();
        assert_eq!(picked, "pm-1");
    }

    #[tokio::test]
    async fn no_fallback_returns_none() {
        let pool = pool_with(AgentPoolConfig {
            fallback_enabled: false,
            ..Default::default()
        });
        register(&pool, "pm-1", AgentType::ProjectManager, &[]).await;
        assert!(pool.find_available_agent("implement", None).await.is_none());
    }

    #[tokio::test]
    async fn assign_task_runs_executor_and_returns_idle() {
        let pool = pool();
        register(&pool, "dev-1", AgentType::FullStackDeveloper, &["implement"]).await;

        let result = pool
            .assign_task("implement", json!({"n": 1}), None)
            .await
            .unwrap();
        assert_eq!(result["echo"]["n"], json!(1));

        let agent = pool.get_agent("dev-1").await.unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert!(agent.current_task.is_none());
        assert_eq!(agent.completed_tasks.len(), 1);
        assert!(agent.completed_tasks[0].success);
    }

    #[tokio::test]
    async fn busy_agent_owns_exactly_one_task() {
        let pool = Arc::new(pool());
        pool.register_agent(
            "slow-1",
            AgentType::FullStackDeveloper,
            ["implement".to_string()],
            Arc::new(SlowAgent),
        )
        .await
        .unwrap();

        let running = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.assign_task("implement", json!({}), None).await })
        };
        // Give the first assignment time to claim the agent.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let agent = pool.get_agent("slow-1").await.unwrap();
        assert_eq!(agent.status, AgentStatus::Busy);
        assert!(agent.current_task.is_some());

        // Second assignment finds nobody idle.
        let err = pool.assign_task("implement", json!({}), None).await;
        assert!(matches!(err, Err(CoreError::AgentUnavailable(_))));
        running.abort();
    }

    #[tokio::test]
    async fn failed_execution_resets_agent_to_idle() {
        let pool = pool();
        pool.register_agent(
            "dev-1",
            AgentType::FullStackDeveloper,
            ["implement".to_string()],
            Arc::new(FailingAgent),
        )
        .await
        .unwrap();

        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = events.clone();
        pool.on_event(move |event| {
            if let PoolEvent::AgentStatusChanged { to, .. } = event {
                sink.lock().push(*to);
            }
        });

        let err = pool.assign_task("implement", json!({}), None).await;
        assert!(err.is_err());

        let agent = pool.get_agent("dev-1").await.unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(agent.completed_tasks.len(), 1);
        assert!(!agent.completed_tasks[0].success);

        let transitions = events.lock().clone();
        assert_eq!(
            transitions,
            vec![AgentStatus::Busy, AgentStatus::Error, AgentStatus::Idle]
        );
    }

    #[tokio::test]
    async fn timeout_is_reported_and_agent_recovers() {
        let pool = pool_with(AgentPoolConfig {
            task_timeout: Duration::from_millis(50),
            ..Default::default()
        });
        pool.register_agent(
            "slow-1",
            AgentType::FullStackDeveloper,
            ["implement".to_string()],
            Arc::new(SlowAgent),
        )
        .await
        .unwrap();

        let err = pool.assign_task("implement", json!({}), None).await;
        assert!(matches!(err, Err(CoreError::Timeout(_))));
        assert_eq!(
            pool.get_agent("slow-1").await.unwrap().status,
            AgentStatus::Idle
        );
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let pool = pool_with(AgentPoolConfig {
            history_limit: 3,
            ..Default::default()
        });
        register(&pool, "dev-1", AgentType::FullStackDeveloper, &["implement"]).await;
        for _ in 0..5 {
            pool.assign_task("implement", json!({}), None).await.unwrap();
        }
        assert_eq!(
            pool.get_agent("dev-1").await.unwrap().completed_tasks.len(),
            3
        );
    }

    #[tokio::test]
    async fn pool_events_fire_for_lifecycle() {
        let pool = pool();
        let count = Arc::new(AtomicU32::new(0));
        let seen = count.clone();
        pool.on_event(move |event| {
            if matches!(
                event,
                PoolEvent::AgentRegistered { .. } | PoolEvent::AgentUnregistered { .. }
            ) {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        register(&pool, "dev-1", AgentType::FullStackDeveloper, &[]).await;
        pool.unregister_agent("dev-1").await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
