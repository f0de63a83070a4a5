//! Durable execution: the queue primitive, typed task queue, idempotent
//! execution and the dead-letter store.
//!
//! Layering, bottom up: [`service::QueueService`] persists jobs through the
//! KV adapter; [`worker`] drains queues; [`task_queue::TaskQueue`] routes
//! task jobs to agent processors; [`dead_letter::DeadLetterQueue`] retains
//! exhausted jobs for manual resolution; [`idempotency::IdempotencyService`]
//! deduplicates executions by payload content.

pub mod dead_letter;
pub mod events;
pub mod idempotency;
pub mod job;
pub mod service;
pub mod task_queue;
pub mod worker;

/// Queue holding task execution jobs.
pub const TASK_QUEUE: &str = "aidos:tasks";
/// Queue used by the scheduler for its own deferred work.
pub const SCHEDULER_QUEUE: &str = "aidos:scheduler";
/// Key namespace of the dead-letter store.
pub const DLQ_QUEUE: &str = "aidos:dlq";

pub use dead_letter::{
    DeadLetterEntry, DeadLetterQueue, DlqFilter, DlqResolution, DlqStats,
};
pub use events::JobEvent;
pub use idempotency::{IdempotencyConfig, IdempotencyService, IdempotentOutcome};
pub use job::{Backoff, BackoffKind, Job, JobCounts, JobOptions};
pub use service::{FailOutcome, QueueConfig, QueueService, Retention};
pub use task_queue::{TaskProcessor, TaskQueue, TaskSubmission};
pub use worker::{JobProcessor, QueueWorker, WorkerPool};
