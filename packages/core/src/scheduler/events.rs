//! Scheduler lifecycle events.
//!
//! Emitted synchronously to registered listeners (which must not block)
//! and published on the context hub under the `scheduler` topic.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TOPIC: &str = "scheduler";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskEvent {
    #[serde(rename = "task_started")]
    Started { task_id: Uuid, agent_id: String },
    #[serde(rename = "task_completed")]
    Completed { task_id: Uuid, duration_ms: u64 },
    #[serde(rename = "task_failed")]
    Failed {
        task_id: Uuid,
        retry: bool,
        error: String,
    },
    #[serde(rename = "task_blocked")]
    Blocked { task_id: Uuid },
    #[serde(rename = "task_retry_scheduled")]
    RetryScheduled { task_id: Uuid, delay_ms: u64 },
}

impl TaskEvent {
    pub fn task_id(&self) -> Uuid {
        match self {
            TaskEvent::Started { task_id, .. }
            | TaskEvent::Completed { task_id, .. }
            | TaskEvent::Failed { task_id, .. }
            | TaskEvent::Blocked { task_id }
            | TaskEvent::RetryScheduled { task_id, .. } => *task_id,
        }
    }
}
