//! Typed agents and the task-type to agent-type mapping.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentType {
    ProjectManager,
    ProductManager,
    Architect,
    FullStackDeveloper,
    QaEngineer,
    DatabaseExpert,
}

impl AgentType {
    pub const ALL: [AgentType; 6] = [
        AgentType::ProjectManager,
        AgentType::ProductManager,
        AgentType::Architect,
        AgentType::FullStackDeveloper,
        AgentType::QaEngineer,
        AgentType::DatabaseExpert,
    ];

    /// Default routing of task types onto agent types. Unknown task types
    /// return `None`, letting the pool consider every type.
    pub fn for_task_type(task_type: &str) -> Option<AgentType> {
        let lowered = task_type.to_lowercase();
        let matched = match lowered.as_str() {
            "plan" | "manage" | "assign" | "track" => AgentType::ProjectManager,
            "analyze" | "requirement" | "prd" => AgentType::ProductManager,
            "design" | "architecture" => AgentType::Architect,
            "develop" | "implement" | "api" => AgentType::FullStackDeveloper,
            "test" | "review" => AgentType::QaEngineer,
            "database" | "db_design" => AgentType::DatabaseExpert,
            _ => return None,
        };
        Some(matched)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    #[default]
    Idle,
    Busy,
    Offline,
    Error,
}

/// Record of a finished assignment kept in the agent's bounded history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedTask {
    pub task_id: Uuid,
    pub task_type: String,
    pub success: bool,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

/// Agent metadata snapshot as seen by callers. Execution happens through
/// the executor registered with the pool; this struct is state only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub agent_type: AgentType,
    pub status: AgentStatus,
    pub capabilities: HashSet<String>,
    pub current_task: Option<Uuid>,
    pub completed_tasks: Vec<CompletedTask>,
    pub registered_at: DateTime<Utc>,
}

impl Agent {
    pub fn can_handle(&self, task_type: &str) -> bool {
        self.capabilities.contains(task_type)
    }
}
