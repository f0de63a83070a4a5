//! Task lifecycle: the task model, scheduler events and the unified
//! scheduler that owns dependency semantics and queue submission.

pub mod events;
pub mod service;
pub mod task;

pub use events::TaskEvent;
pub use service::{Scheduler, SchedulerConfig, SchedulerStatus};
pub use task::{NewTask, Task, TaskPriority, TaskStatus};
