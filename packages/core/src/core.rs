//! Assembly of the execution core.
//!
//! `Core` wires the components together in dependency order over one
//! [`CoreContext`]: classifier → dead letter → queue → task queue →
//! scheduler, plus the agent pool, idempotency, monitors and self-healing.
//! Hosts that only need a subset can construct components directly; this
//! facade is the default wiring used by the API layer and the end-to-end
//! tests.

use std::sync::Arc;

use crate::config::CoreConfig;
use crate::error::Result;
use crate::healing::SelfHealingService;
use crate::kernel::CoreContext;
use crate::monitoring::{
    ApplicationMonitor, BusinessMonitor, InfrastructureMonitor, QueueMonitor,
};
use crate::pool::AgentPool;
use crate::queue::{
    DeadLetterQueue, IdempotencyService, QueueService, TaskQueue, TASK_QUEUE,
};
use crate::resilience::ErrorClassifier;
use crate::scheduler::{Scheduler, TaskEvent};

pub struct Core {
    pub context: CoreContext,
    pub classifier: Arc<ErrorClassifier>,
    pub queue: Arc<QueueService>,
    pub task_queue: Arc<TaskQueue>,
    pub dead_letter: Arc<DeadLetterQueue>,
    pub idempotency: Arc<IdempotencyService>,
    pub scheduler: Arc<Scheduler>,
    pub pool: Arc<AgentPool>,
    pub healing: Arc<SelfHealingService>,
    pub application_monitor: Arc<ApplicationMonitor>,
    pub business_monitor: Arc<BusinessMonitor>,
    config: CoreConfig,
}

impl Core {
    pub fn new(config: CoreConfig, context: CoreContext) -> Self {
        let classifier = Arc::new(ErrorClassifier::new(context.clock.clone()));
        let dead_letter = Arc::new(DeadLetterQueue::new(
            context.kv.clone(),
            context.clock.clone(),
        ));
        let queue = Arc::new(
            QueueService::new(
                context.kv.clone(),
                context.clock.clone(),
                context.hub.clone(),
                config.queue.clone(),
            )
            .with_dead_letter(dead_letter.clone()),
        );
        let task_queue = Arc::new(TaskQueue::new(queue.clone(), classifier.clone(), TASK_QUEUE));
        let scheduler = Arc::new(Scheduler::new(
            config.scheduler.clone(),
            context.clock.clone(),
            context.hub.clone(),
            task_queue.clone(),
        ));
        let pool = Arc::new(AgentPool::new(
            config.pool.clone(),
            context.clock.clone(),
            context.hub.clone(),
        ));
        let idempotency = Arc::new(IdempotencyService::new(
            context.kv.clone(),
            context.clock.clone(),
            config.idempotency.clone(),
        ));
        let healing = Arc::new(SelfHealingService::new(
            config.healing.clone(),
            context.clock.clone(),
            context.hub.clone(),
            context.command_runner.clone(),
            context.notifier.clone(),
        ));
        let application_monitor = Arc::new(ApplicationMonitor::new(context.metrics.clone()));
        let business_monitor = Arc::new(BusinessMonitor::new(
            context.clock.clone(),
            context.metrics.clone(),
        ));

        // Scheduler outcomes feed the task metric family, and terminal
        // failures whose classification is user-facing (bad input, auth)
        // surface through the notifier instead of dying in a log.
        {
            let metrics = context.metrics.clone();
            let notifier = context.notifier.clone();
            let failure_classifier = classifier.clone();
            scheduler.on_event(move |event| match event {
                TaskEvent::Completed { duration_ms, .. } => {
                    metrics.record_task_execution(true, *duration_ms);
                }
                TaskEvent::Failed {
                    retry: false,
                    task_id,
                    error,
                } => {
                    metrics.record_task_execution(false, 0);
                    let classification = failure_classifier.classify_message(error);
                    if matches!(
                        classification.level,
                        crate::resilience::ErrorLevel::UserInput
                            | crate::resilience::ErrorLevel::Auth
                    ) {
                        let notifier = notifier.clone();
                        let task_id = *task_id;
                        let message = error.clone();
                        tokio::spawn(async move {
                            let _ = notifier
                                .notify("user-errors", &format!("task {task_id} failed"), &message)
                                .await;
                        });
                    }
                }
                _ => {}
            });
        }

        Self {
            context,
            classifier,
            queue,
            task_queue,
            dead_letter,
            idempotency,
            scheduler,
            pool,
            healing,
            application_monitor,
            business_monitor,
            config,
        }
    }

    /// Start the scheduler's workers and event listener.
    pub fn start(&self) {
        self.scheduler.start();
    }

    /// Stop workers after their current job; the durable store keeps
    /// everything else.
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
    }

    /// Construct the periodic infrastructure monitor for this core.
    pub fn infrastructure_monitor(&self) -> InfrastructureMonitor {
        InfrastructureMonitor::new(
            self.config.infrastructure.clone(),
            self.context.metrics.clone(),
            self.context.hub.clone(),
        )
    }

    /// Construct the periodic queue-health monitor for this core.
    pub fn queue_monitor(&self) -> QueueMonitor {
        QueueMonitor::new(
            self.config.queue_monitor.clone(),
            self.context.clock.clone(),
            self.context.hub.clone(),
            self.queue.clone(),
            self.dead_letter.clone(),
            vec![TASK_QUEUE.to_string()],
        )
    }

    /// Liveness of the durable store.
    pub async fn ping(&self) -> Result<()> {
        self.context.kv.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn core_assembles_and_pings() {
        let (context, _deps) = CoreContext::for_tests();
        let core = Core::new(CoreConfig::default(), context);
        core.ping().await.unwrap();
        assert_eq!(core.task_queue.queue_name(), TASK_QUEUE);
    }
}
