//! Typed task layer over the queue service.
//!
//! Routes jobs to agent-specific processors. The payload on the wire is the
//! task record `{taskId, taskName, agentId, payload, priority, timeoutMs,
//! retries}` with wire priority `10 - task priority`, so CRITICAL tasks pop
//! before everything else.
//!
//! A missing processor is not retryable: the job *completes* carrying
//! `{success: false, error: ...}` instead of erroring, since re-running it
//! cannot conjure the processor into existence. Processor failures, by
//! contrast, propagate as errors so the queue applies retry policy.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::resilience::ErrorClassifier;
use crate::scheduler::task::TaskPriority;

use super::job::{Backoff, Job, JobOptions};
use super::service::QueueService;
use super::worker::{JobProcessor, WorkerPool};

/// Agent-side processor: receives the task payload, returns the task result.
pub type TaskProcessor = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Submission handed down by the scheduler.
#[derive(Debug, Clone)]
pub struct TaskSubmission {
    pub task_id: Uuid,
    pub task_name: String,
    pub agent_id: String,
    pub payload: Value,
    pub priority: TaskPriority,
    pub timeout_ms: u64,
    pub retries: u32,
}

pub struct TaskQueue {
    service: Arc<QueueService>,
    classifier: Arc<ErrorClassifier>,
    queue: String,
    processors: RwLock<HashMap<String, TaskProcessor>>,
}

impl TaskQueue {
    pub fn new(
        service: Arc<QueueService>,
        classifier: Arc<ErrorClassifier>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            service,
            classifier,
            queue: queue.into(),
            processors: RwLock::new(HashMap::new()),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn service(&self) -> &Arc<QueueService> {
        &self.service
    }

    /// Register the processor that executes tasks assigned to `agent_id`.
    /// Re-registering replaces the previous processor.
    pub fn register_processor<F, Fut>(&self, agent_id: impl Into<String>, processor: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let boxed: TaskProcessor = Arc::new(move |payload| processor(payload).boxed());
        self.processors.write().insert(agent_id.into(), boxed);
    }

    pub fn has_processor(&self, agent_id: &str) -> bool {
        self.processors.read().contains_key(agent_id)
    }

    fn wire_record(submission: &TaskSubmission) -> Value {
        json!({
            "taskId": submission.task_id,
            "taskName": submission.task_name,
            "agentId": submission.agent_id,
            "payload": submission.payload,
            "priority": submission.priority.wire_priority(),
            "timeoutMs": submission.timeout_ms,
            "retries": submission.retries,
        })
    }

    fn options(submission: &TaskSubmission) -> JobOptions {
        JobOptions {
            priority: Some(submission.priority.wire_priority()),
            max_attempts: Some(submission.retries.max(1)),
            backoff: Some(Backoff::default()),
            timeout_ms: Some(submission.timeout_ms),
            task_id: Some(submission.task_id),
            ..Default::default()
        }
    }

    /// Enqueue a task for immediate execution. Returns the job id.
    pub async fn add_task(&self, submission: TaskSubmission) -> Result<String> {
        let job = self
            .service
            .add_job(
                &self.queue,
                &submission.task_name,
                Self::wire_record(&submission),
                Self::options(&submission),
            )
            .await?;
        Ok(job.id)
    }

    /// Enqueue a task that becomes eligible after `delay_ms`.
    pub async fn add_delayed_task(
        &self,
        submission: TaskSubmission,
        delay_ms: u64,
    ) -> Result<String> {
        let mut opts = Self::options(&submission);
        opts.delay_ms = Some(delay_ms);
        let job = self
            .service
            .add_job(
                &self.queue,
                &submission.task_name,
                Self::wire_record(&submission),
                opts,
            )
            .await?;
        Ok(job.id)
    }

    /// The single worker processor: dispatch the job to its agent's
    /// processor and wrap the outcome in a result record.
    pub async fn process_task(&self, job: &Job) -> Result<Value> {
        let agent_id = job
            .data
            .get("agentId")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::Validation("job record has no agentId".to_string()))?
            .to_string();
        let task_id = job.data.get("taskId").cloned().unwrap_or(Value::Null);
        let payload = job.data.get("payload").cloned().unwrap_or(Value::Null);

        let processor = self.processors.read().get(&agent_id).cloned();
        let Some(processor) = processor else {
            warn!(job_id = %job.id, agent_id = %agent_id, "no processor registered, completing as failure");
            return Ok(json!({
                "success": false,
                "taskId": task_id,
                "error": format!("no processor registered for agent {agent_id}"),
            }));
        };

        match processor(payload).await {
            Ok(result) => Ok(json!({
                "success": true,
                "taskId": task_id,
                "result": result,
            })),
            Err(error) => Err(error),
        }
    }

    /// Spawn workers draining this task queue.
    pub fn start_workers(self: &Arc<Self>, concurrency: usize) -> WorkerPool {
        let task_queue = self.clone();
        let processor: JobProcessor = Arc::new(move |job| {
            let task_queue = task_queue.clone();
            async move { task_queue.process_task(&job).await }.boxed()
        });
        self.service
            .create_worker(self.classifier.clone(), &self.queue, processor, concurrency)
    }
}
