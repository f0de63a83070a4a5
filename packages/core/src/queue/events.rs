//! Job lifecycle events.
//!
//! Facts about what happened to jobs, published on the context hub under
//! the `jobs:<queue>` topic. The scheduler listens here to map queue
//! outcomes back onto task state; external observers may subscribe too.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEvent {
    Enqueued {
        job_id: String,
        task_id: Option<Uuid>,
        name: String,
        delayed_ms: Option<u64>,
    },
    Started {
        job_id: String,
        task_id: Option<Uuid>,
        name: String,
        worker_id: String,
        attempt: u32,
    },
    Succeeded {
        job_id: String,
        task_id: Option<Uuid>,
        name: String,
        result: Option<Value>,
        duration_ms: u64,
    },
    Failed {
        job_id: String,
        task_id: Option<Uuid>,
        name: String,
        error: String,
        attempt: u32,
        will_retry: bool,
        retry_delay_ms: Option<u64>,
    },
    DeadLettered {
        job_id: String,
        task_id: Option<Uuid>,
        name: String,
        total_attempts: u32,
        final_error: String,
    },
    Requeued {
        job_id: String,
        entry_id: String,
        task_id: Option<Uuid>,
    },
}

/// Hub topic for a queue's job events.
pub fn topic(queue: &str) -> String {
    format!("jobs:{queue}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_is_namespaced_by_queue() {
        assert_eq!(topic("aidos:tasks"), "jobs:aidos:tasks");
    }

    #[test]
    fn events_serialize_with_kind_tag() {
        let event = JobEvent::Failed {
            job_id: "j1".to_string(),
            task_id: None,
            name: "build".to_string(),
            error: "ETIMEDOUT".to_string(),
            attempt: 2,
            will_retry: false,
            retry_delay_ms: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"failed\""));
        assert!(json.contains("will_retry"));
    }

    #[test]
    fn events_roundtrip() {
        let events = vec![
            JobEvent::Enqueued {
                job_id: "j1".to_string(),
                task_id: Some(Uuid::new_v4()),
                name: "build".to_string(),
                delayed_ms: Some(5_000),
            },
            JobEvent::Succeeded {
                job_id: "j1".to_string(),
                task_id: None,
                name: "build".to_string(),
                result: Some(serde_json::json!({"success": true})),
                duration_ms: 120,
            },
            JobEvent::DeadLettered {
                job_id: "j1".to_string(),
                task_id: None,
                name: "build".to_string(),
                total_attempts: 2,
                final_error: "timeout".to_string(),
            },
        ];
        for event in events {
            let json = serde_json::to_string(&event).unwrap();
            let _: JobEvent = serde_json::from_str(&json).unwrap();
        }
    }
}
