//! Unified task scheduler.
//!
//! Owns the in-memory task registry, dependency semantics and queue
//! submission. Scheduling a task whose dependencies are unfinished parks it
//! in BLOCKED; completion of the last dependency re-schedules it
//! automatically. Failure of a dependency fails every (transitive)
//! dependent immediately.
//!
//! Outcomes flow back from the durable queue as [`JobEvent`]s on the
//! context hub; the scheduler folds them into task state and re-emits
//! [`TaskEvent`]s to its own listeners.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::common::{new_id, Clock};
use crate::error::{CoreError, Result};
use crate::kernel::EventHub;
use crate::queue::events as job_events;
use crate::queue::{JobCounts, JobEvent, TaskQueue, TaskSubmission, WorkerPool};

use super::events::{TaskEvent, TOPIC};
use super::task::{NewTask, Task, TaskStatus};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker slots draining the task queue.
    pub max_concurrent_tasks: usize,
    pub task_timeout_ms: u64,
    /// Delay used when a task is re-scheduled explicitly after a failure.
    pub retry_delay_ms: u64,
    pub enable_parallel_execution: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            task_timeout_ms: 300_000,
            retry_delay_ms: 5_000,
            enable_parallel_execution: true,
        }
    }
}

/// Aggregate view over the registry and the underlying queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub pending: u64,
    pub blocked: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub queue: JobCounts,
}

type EventListener = Box<dyn Fn(&TaskEvent) + Send + Sync>;

struct Runtime {
    listener: tokio::task::JoinHandle<()>,
    pool: WorkerPool,
}

pub struct Scheduler {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    hub: EventHub,
    task_queue: Arc<TaskQueue>,
    tasks: RwLock<HashMap<Uuid, Task>>,
    /// Reverse dependency edges: task id -> tasks depending on it.
    dependents: RwLock<HashMap<Uuid, Vec<Uuid>>>,
    listeners: parking_lot::Mutex<Vec<EventListener>>,
    runtime: parking_lot::Mutex<Option<Runtime>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
        hub: EventHub,
        task_queue: Arc<TaskQueue>,
    ) -> Self {
        Self {
            config,
            clock,
            hub,
            task_queue,
            tasks: RwLock::new(HashMap::new()),
            dependents: RwLock::new(HashMap::new()),
            listeners: parking_lot::Mutex::new(Vec::new()),
            runtime: parking_lot::Mutex::new(None),
        }
    }

    pub fn task_queue(&self) -> &Arc<TaskQueue> {
        &self.task_queue
    }

    /// Subscribe to scheduler events. Listeners run synchronously on the
    /// emitting path and must not block.
    pub fn on_event<F>(&self, listener: F)
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Box::new(listener));
    }

    async fn emit(&self, event: TaskEvent) {
        for listener in self.listeners.lock().iter() {
            listener(&event);
        }
        self.hub.publish_event(TOPIC, &event);
    }

    /// Attach the executor for an agent id. Executors receive the task
    /// payload and return the task result.
    pub fn register_executor<F, Fut>(&self, agent_id: impl Into<String>, executor: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        self.task_queue.register_processor(agent_id, executor);
    }

    // Registry ----------------------------------------------------------

    /// Validate and insert a task. Dependencies must already exist in the
    /// registry, which also makes dependency cycles unrepresentable; a
    /// cycle check still guards the walk used for fail-fast propagation.
    pub async fn add_task(&self, new: NewTask) -> Result<Uuid> {
        new.validate()?;

        let mut tasks = self.tasks.write().await;
        for dep in &new.dependencies {
            if !tasks.contains_key(dep) {
                return Err(CoreError::Validation(format!(
                    "unknown dependency: {dep}"
                )));
            }
        }

        let id = new_id();
        if Self::would_cycle(&tasks, id, &new.dependencies) {
            return Err(CoreError::Validation(
                "dependency cycle detected".to_string(),
            ));
        }

        let mut task = Task::builder()
            .id(id)
            .name(new.name)
            .payload(new.payload)
            .priority(new.priority)
            .dependencies(new.dependencies.clone())
            .max_retries(new.max_retries)
            .timeout_ms(new.timeout_ms.unwrap_or(self.config.task_timeout_ms))
            .created_at(self.clock.now())
            .build();
        task.agent_id = new.agent_id;

        for dep in &new.dependencies {
            self.dependents
                .write()
                .await
                .entry(*dep)
                .or_default()
                .push(id);
        }
        tasks.insert(id, task);
        debug!(task_id = %id, "task added");
        Ok(id)
    }

    fn would_cycle(tasks: &HashMap<Uuid, Task>, new_id: Uuid, deps: &[Uuid]) -> bool {
        // DFS from each dependency through existing edges looking for the
        // new task's id (which cannot be in the map yet, so this only
        // triggers if a forged id re-enters its own closure).
        let mut stack: Vec<Uuid> = deps.to_vec();
        let mut seen = std::collections::HashSet::new();
        while let Some(current) = stack.pop() {
            if current == new_id {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(task) = tasks.get(&current) {
                stack.extend(task.dependencies.iter().copied());
            }
        }
        false
    }

    pub async fn get_task(&self, task_id: Uuid) -> Option<Task> {
        self.tasks.read().await.get(&task_id).cloned()
    }

    pub async fn list_tasks(&self) -> Vec<Task> {
        self.tasks.read().await.values().cloned().collect()
    }

    /// Counts by status plus the underlying queue counters.
    pub async fn get_status(&self) -> Result<SchedulerStatus> {
        let mut status = SchedulerStatus::default();
        {
            let tasks = self.tasks.read().await;
            for task in tasks.values() {
                match task.status {
                    TaskStatus::Pending => status.pending += 1,
                    TaskStatus::Blocked => status.blocked += 1,
                    TaskStatus::Running => status.running += 1,
                    TaskStatus::Completed => status.completed += 1,
                    TaskStatus::Failed => status.failed += 1,
                }
            }
        }
        status.queue = self
            .task_queue
            .service()
            .get_job_counts(self.task_queue.queue_name())
            .await?;
        Ok(status)
    }

    /// True once the registry is non-empty and every task is terminal.
    pub async fn is_complete(&self) -> bool {
        let tasks = self.tasks.read().await;
        !tasks.is_empty() && tasks.values().all(|t| t.status.is_terminal())
    }

    /// Drop all tasks. Queue state is untouched.
    pub async fn reset(&self) {
        self.tasks.write().await.clear();
        self.dependents.write().await.clear();
    }

    // Scheduling --------------------------------------------------------

    /// Move a task towards execution on `agent_id`. Unfinished dependencies
    /// park it in BLOCKED; a failed dependency fails it immediately.
    pub async fn schedule_task(&self, task_id: Uuid, agent_id: &str) -> Result<()> {
        self.schedule_inner(task_id, agent_id, None).await
    }

    /// Like [`Self::schedule_task`] but submitted with a delay; used for
    /// explicit retry scheduling.
    pub async fn schedule_delayed_task(
        &self,
        task_id: Uuid,
        agent_id: &str,
        delay_ms: u64,
    ) -> Result<()> {
        self.schedule_inner(task_id, agent_id, Some(delay_ms)).await
    }

    /// Re-schedule after the configured retry delay.
    pub async fn schedule_retry(&self, task_id: Uuid, agent_id: &str) -> Result<()> {
        self.schedule_inner(task_id, agent_id, Some(self.config.retry_delay_ms))
            .await
    }

    async fn schedule_inner(
        &self,
        task_id: Uuid,
        agent_id: &str,
        delay_ms: Option<u64>,
    ) -> Result<()> {
        enum Decision {
            DependencyFailed,
            Blocked { newly: bool },
            Run(TaskSubmission),
        }

        let decision = {
            let mut tasks = self.tasks.write().await;
            let task = tasks.get(&task_id).ok_or(CoreError::TaskNotFound(task_id))?;
            match task.status {
                TaskStatus::Pending | TaskStatus::Blocked => {}
                other => {
                    return Err(CoreError::Validation(format!(
                        "task {task_id} cannot be scheduled from {other:?}"
                    )))
                }
            }
            let deps = task.dependencies.clone();
            let dep_states: Vec<TaskStatus> = deps
                .iter()
                .filter_map(|dep| tasks.get(dep).map(|t| t.status))
                .collect();

            let now = self.clock.now();
            let task = tasks.get_mut(&task_id).expect("checked above");
            task.agent_id = Some(agent_id.to_string());

            if dep_states.iter().any(|s| *s == TaskStatus::Failed) {
                task.status = TaskStatus::Failed;
                task.error = Some("dependency failed".to_string());
                task.completed_at = Some(now);
                Decision::DependencyFailed
            } else if dep_states.iter().any(|s| !s.is_terminal()) {
                let newly = task.status != TaskStatus::Blocked;
                task.status = TaskStatus::Blocked;
                Decision::Blocked { newly }
            } else {
                task.status = TaskStatus::Running;
                task.started_at = Some(now);
                Decision::Run(TaskSubmission {
                    task_id,
                    task_name: task.name.clone(),
                    agent_id: agent_id.to_string(),
                    payload: task.payload.clone(),
                    priority: task.priority,
                    timeout_ms: task.timeout_ms,
                    retries: task.max_retries.max(1),
                })
            }
        };

        let submission = match decision {
            Decision::DependencyFailed => {
                self.emit(TaskEvent::Failed {
                    task_id,
                    retry: false,
                    error: "dependency failed".to_string(),
                })
                .await;
                return Ok(());
            }
            Decision::Blocked { newly } => {
                if newly {
                    self.emit(TaskEvent::Blocked { task_id }).await;
                }
                return Ok(());
            }
            Decision::Run(submission) => submission,
        };

        self.emit(TaskEvent::Started {
            task_id,
            agent_id: agent_id.to_string(),
        })
        .await;

        let submitted = match delay_ms {
            Some(delay) => {
                let result = self.task_queue.add_delayed_task(submission, delay).await;
                if result.is_ok() {
                    self.emit(TaskEvent::RetryScheduled {
                        task_id,
                        delay_ms: delay,
                    })
                    .await;
                }
                result
            }
            None => self.task_queue.add_task(submission).await,
        };

        if let Err(e) = submitted {
            error!(task_id = %task_id, error = %e, "failed to submit task to queue");
            self.fail_task(task_id, format!("queue submission failed: {e}"), false)
                .await;
            return Ok(());
        }
        Ok(())
    }

    // Outcome handling --------------------------------------------------

    async fn complete_task(&self, task_id: Uuid, result: Value) {
        let duration_ms = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(&task_id) else {
                return;
            };
            // Completion only makes sense for a running task; late or
            // duplicate queue events are dropped.
            if task.status != TaskStatus::Running {
                return;
            }
            let now = self.clock.now();
            task.status = TaskStatus::Completed;
            task.completed_at = Some(now);
            task.result = Some(result);
            task.started_at
                .map(|s| (now - s).num_milliseconds().max(0) as u64)
                .unwrap_or(0)
        };

        info!(task_id = %task_id, duration_ms, "task completed");
        self.emit(TaskEvent::Completed {
            task_id,
            duration_ms,
        })
        .await;
        self.reschedule_unblocked_dependents(task_id).await;
    }

    /// Dependents of a finished task whose dependencies are now all
    /// completed go back through scheduling.
    async fn reschedule_unblocked_dependents(&self, completed: Uuid) {
        let ready: Vec<(Uuid, String)> = {
            let tasks = self.tasks.read().await;
            let dependents = self.dependents.read().await;
            dependents
                .get(&completed)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| {
                            let task = tasks.get(id)?;
                            if task.status != TaskStatus::Blocked {
                                return None;
                            }
                            let all_done = task.dependencies.iter().all(|dep| {
                                tasks
                                    .get(dep)
                                    .map(|t| t.status == TaskStatus::Completed)
                                    .unwrap_or(false)
                            });
                            let agent = task.agent_id.clone()?;
                            all_done.then_some((*id, agent))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        for (task_id, agent_id) in ready {
            debug!(task_id = %task_id, "dependencies satisfied, rescheduling");
            if let Err(e) = self.schedule_task(task_id, &agent_id).await {
                warn!(task_id = %task_id, error = %e, "failed to reschedule unblocked task");
            }
        }
    }

    async fn fail_task(&self, task_id: Uuid, error: String, retried: bool) {
        // Fail the task and, fail-fast, every transitive dependent that is
        // not already terminal.
        let mut failed: Vec<(Uuid, String)> = Vec::new();
        {
            let mut tasks = self.tasks.write().await;
            let dependents = self.dependents.read().await;
            let mut stack = vec![(task_id, error.clone())];
            while let Some((id, reason)) = stack.pop() {
                let Some(task) = tasks.get_mut(&id) else {
                    continue;
                };
                if task.status.is_terminal() {
                    continue;
                }
                task.status = TaskStatus::Failed;
                task.error = Some(reason.clone());
                task.completed_at = Some(self.clock.now());
                failed.push((id, reason));
                if let Some(children) = dependents.get(&id) {
                    for child in children {
                        stack.push((*child, format!("dependency failed: {id}")));
                    }
                }
            }
        }

        for (id, reason) in failed {
            warn!(task_id = %id, error = %reason, "task failed");
            self.emit(TaskEvent::Failed {
                task_id: id,
                retry: retried && id == task_id,
                error: reason,
            })
            .await;
        }
    }

    /// Fold one queue event into task state.
    pub async fn handle_job_event(&self, event: JobEvent) {
        match event {
            JobEvent::Succeeded {
                task_id: Some(task_id),
                result,
                ..
            } => {
                // The task queue wraps outcomes in a result record; a
                // missing processor completes the job but fails the task.
                let record = result.unwrap_or(Value::Null);
                let success = record
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if success {
                    let task_result = record.get("result").cloned().unwrap_or(Value::Null);
                    self.complete_task(task_id, task_result).await;
                } else {
                    let error = record
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("task execution failed")
                        .to_string();
                    self.fail_task(task_id, error, false).await;
                }
            }
            JobEvent::Failed {
                task_id: Some(task_id),
                error,
                attempt,
                will_retry,
                retry_delay_ms,
                ..
            } => {
                if will_retry {
                    {
                        let mut tasks = self.tasks.write().await;
                        if let Some(task) = tasks.get_mut(&task_id) {
                            task.retries = attempt.min(task.max_retries);
                            task.error = Some(error.clone());
                        }
                    }
                    self.emit(TaskEvent::RetryScheduled {
                        task_id,
                        delay_ms: retry_delay_ms.unwrap_or(0),
                    })
                    .await;
                } else {
                    self.fail_task(task_id, error, false).await;
                }
            }
            _ => {}
        }
    }

    // Runtime -----------------------------------------------------------

    /// Start the queue workers and the job-event listener.
    pub fn start(self: &Arc<Self>) {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return;
        }

        let concurrency = if self.config.enable_parallel_execution {
            self.config.max_concurrent_tasks
        } else {
            1
        };
        let pool = self.task_queue.start_workers(concurrency);

        let scheduler = self.clone();
        let listener = tokio::spawn(async move {
            let topic = job_events::topic(scheduler.task_queue.queue_name());
            let mut rx = scheduler.hub.subscribe(&topic);
            // Missed events are counted by the hub; the durable queue state
            // is the source of truth, so a lagged fold only delays outcomes
            // until the next event for the same task.
            while let Some(value) = rx.recv().await {
                if let Ok(event) = serde_json::from_value::<JobEvent>(value) {
                    scheduler.handle_job_event(event).await;
                }
            }
        });

        *runtime = Some(Runtime { listener, pool });
        info!(concurrency, "scheduler started");
    }

    /// Stop workers after their current job and drop the listener.
    pub async fn stop(&self) {
        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            runtime.listener.abort();
            runtime.pool.close().await;
            info!("scheduler stopped");
        }
    }
}
