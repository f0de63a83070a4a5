//! Task model and validation.
//!
//! A task is the scheduler's atom of work: it has a lifecycle
//! (PENDING → BLOCKED/RUNNING → COMPLETED/FAILED), an optional agent
//! assignment and up to 100 dependencies on other tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::{CoreError, Result};

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_DEPENDENCIES: usize = 100;
pub const MAX_MAX_RETRIES: u32 = 10;
pub const MIN_TIMEOUT_MS: u64 = 1_000;
pub const MAX_TIMEOUT_MS: u64 = 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl TaskPriority {
    /// On-queue priority: `10 - task priority`, where the queue treats the
    /// numerically lowest value as most urgent. CRITICAL maps to 7 and pops
    /// before everything else.
    pub fn wire_priority(self) -> u8 {
        10 - self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Pending,
    Blocked,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Legal transitions. Terminal states have none.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Blocked)
                | (Pending, Running)
                | (Pending, Failed)
                | (Blocked, Pending)
                | (Blocked, Failed)
                | (Running, Completed)
                | (Running, Failed)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    /// Agent this task is assigned to; set at latest when scheduled.
    #[builder(default, setter(strip_option))]
    pub agent_id: Option<String>,
    pub payload: Value,
    #[builder(default)]
    pub priority: TaskPriority,
    #[builder(default)]
    pub dependencies: Vec<Uuid>,
    #[builder(default)]
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default = 0)]
    pub retries: u32,
    #[builder(default = 3)]
    pub max_retries: u32,
    #[builder(default = 300_000)]
    pub timeout_ms: u64,
    #[builder(default, setter(strip_option))]
    pub error: Option<String>,
    #[builder(default, setter(strip_option))]
    pub result: Option<Value>,
}

/// Input accepted by `Scheduler::add_task`. A `None` timeout falls back to
/// the scheduler's configured task timeout.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub agent_id: Option<String>,
    pub payload: Value,
    pub priority: TaskPriority,
    pub dependencies: Vec<Uuid>,
    pub max_retries: u32,
    pub timeout_ms: Option<u64>,
}

impl Default for NewTask {
    fn default() -> Self {
        Self {
            name: String::new(),
            agent_id: None,
            payload: Value::Null,
            priority: TaskPriority::Normal,
            dependencies: Vec::new(),
            max_retries: 3,
            timeout_ms: None,
        }
    }
}

impl NewTask {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.len() > MAX_NAME_LEN {
            return Err(CoreError::Validation(format!(
                "task name must be 1-{MAX_NAME_LEN} characters"
            )));
        }
        if self.dependencies.len() > MAX_DEPENDENCIES {
            return Err(CoreError::Validation(format!(
                "at most {MAX_DEPENDENCIES} dependencies allowed"
            )));
        }
        if self.max_retries > MAX_MAX_RETRIES {
            return Err(CoreError::Validation(format!(
                "max_retries must be 0-{MAX_MAX_RETRIES}"
            )));
        }
        if let Some(timeout_ms) = self.timeout_ms {
            if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&timeout_ms) {
                return Err(CoreError::Validation(format!(
                    "timeout_ms must be {MIN_TIMEOUT_MS}-{MAX_TIMEOUT_MS}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_priority_decreases_with_task_priority() {
        assert_eq!(TaskPriority::Low.wire_priority(), 10);
        assert_eq!(TaskPriority::Normal.wire_priority(), 9);
        assert_eq!(TaskPriority::High.wire_priority(), 8);
        assert_eq!(TaskPriority::Critical.wire_priority(), 7);
    }

    #[test]
    fn terminal_states_have_no_transitions() {
        for next in [
            TaskStatus::Pending,
            TaskStatus::Blocked,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert!(!TaskStatus::Completed.can_transition_to(next));
            assert!(!TaskStatus::Failed.can_transition_to(next));
        }
    }

    #[test]
    fn lifecycle_transitions_follow_the_dag() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Blocked));
        assert!(Pending.can_transition_to(Failed));
        assert!(Blocked.can_transition_to(Pending));
        assert!(Blocked.can_transition_to(Failed));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Blocked.can_transition_to(Running));
        assert!(!Running.can_transition_to(Pending));
    }

    #[test]
    fn empty_name_is_rejected() {
        assert!(NewTask::named("").validate().is_err());
    }

    #[test]
    fn oversized_name_is_rejected() {
        assert!(NewTask::named("x".repeat(201)).validate().is_err());
        assert!(NewTask::named("x".repeat(200)).validate().is_ok());
    }

    #[test]
    fn too_many_dependencies_are_rejected() {
        let mut task = NewTask::named("deps");
        task.dependencies = (0..101).map(|_| Uuid::new_v4()).collect();
        assert!(task.validate().is_err());
        task.dependencies.truncate(100);
        assert!(task.validate().is_ok());
    }

    #[test]
    fn retry_and_timeout_bounds_are_enforced() {
        let mut task = NewTask::named("bounds");
        task.max_retries = 11;
        assert!(task.validate().is_err());
        task.max_retries = 10;
        assert!(task.validate().is_ok());

        task.timeout_ms = Some(999);
        assert!(task.validate().is_err());
        task.timeout_ms = Some(1_000);
        assert!(task.validate().is_ok());
        task.timeout_ms = Some(3_600_001);
        assert!(task.validate().is_err());
        task.timeout_ms = None;
        assert!(task.validate().is_ok());
    }
}
