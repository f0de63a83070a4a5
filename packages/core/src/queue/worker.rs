//! Polling queue workers.
//!
//! A worker pool spawns `concurrency` cooperating workers against one queue.
//! Each worker claims one ready job, runs the processor under the job's
//! timeout, reports the outcome back to the queue service and only then
//! claims again. Idle workers back off from the minimum poll interval up to
//! the maximum. Shutdown is cooperative: workers finish their current job
//! before exiting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::common::{new_id, worker_id, Clock};
use crate::error::{CoreError, Result};
use crate::kernel::Service;
use crate::resilience::{Classification, ErrorCategory, ErrorClassifier, ErrorLevel};

use super::job::Job;
use super::service::QueueService;

/// Processor invoked for each claimed job. Returning `Err` routes the job
/// through retry/dead-letter handling; the error never escapes the worker.
pub type JobProcessor = Arc<dyn Fn(Job) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

pub struct QueueWorker {
    service: Arc<QueueService>,
    classifier: Arc<ErrorClassifier>,
    queue: String,
    processor: JobProcessor,
    worker_id: String,
}

impl QueueWorker {
    pub fn new(
        service: Arc<QueueService>,
        classifier: Arc<ErrorClassifier>,
        queue: impl Into<String>,
        processor: JobProcessor,
    ) -> Self {
        Self {
            service,
            classifier,
            queue: queue.into(),
            processor,
            worker_id: worker_id(),
        }
    }

    async fn process_job(&self, job: Job, shutdown: &CancellationToken) {
        let job_id = job.id.clone();
        let timeout = Duration::from_millis(job.timeout_ms);
        let work = (self.processor)(job.clone());

        let outcome = tokio::time::timeout(timeout, work).await;
        let result = match outcome {
            Ok(Ok(result)) => {
                if let Err(e) = self.service.complete_job(job, result).await {
                    error!(job_id = %job_id, error = %e, "failed to mark job completed");
                }
                return;
            }
            Ok(Err(error)) => {
                if shutdown.is_cancelled() || error.is_shutdown() {
                    // Interrupted by graceful shutdown: always worth retrying.
                    shutdown_classification(self.service.clock(), &error)
                } else {
                    self.classifier.classify(&error)
                }
            }
            Err(_elapsed) => {
                let error = CoreError::Timeout(job.timeout_ms);
                self.classifier.classify(&error)
            }
        };

        if let Err(e) = self.service.fail_job(job, &result).await {
            error!(job_id = %job_id, error = %e, "failed to record job failure");
        }
    }
}

fn shutdown_classification(clock: Arc<dyn Clock>, error: &CoreError) -> Classification {
    Classification {
        id: new_id(),
        level: ErrorLevel::Recoverable,
        category: ErrorCategory::Unknown,
        should_retry: true,
        max_retries: 3,
        message: format!("interrupted by shutdown: {error}"),
        timestamp: clock.now(),
    }
}

#[async_trait]
impl Service for QueueWorker {
    fn name(&self) -> &'static str {
        "queue-worker"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(worker_id = %self.worker_id, queue = %self.queue, "queue worker starting");
        let min_poll = self.service.config().min_poll_interval;
        let max_poll = self.service.config().max_poll_interval;
        let mut idle_backoff = min_poll;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.service.claim_next(&self.queue, &self.worker_id).await {
                Ok(Some(job)) => {
                    idle_backoff = min_poll;
                    debug!(worker_id = %self.worker_id, job_id = %job.id, "claimed job");
                    self.process_job(job, &shutdown).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(idle_backoff) => {}
                    }
                    idle_backoff = (idle_backoff * 2).min(max_poll);
                }
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = %e, "failed to claim job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.worker_id, queue = %self.queue, "queue worker stopped");
        Ok(())
    }
}

/// Handle over a set of spawned workers. Dropping the pool does NOT stop
/// the workers; call [`WorkerPool::close`].
pub struct WorkerPool {
    shutdown: CancellationToken,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
    /// Stop workers after their current job and wait for them to exit.
    pub async fn close(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

impl QueueService {
    /// Spawn `concurrency` workers processing `queue` with `processor`.
    pub fn create_worker(
        self: &Arc<Self>,
        classifier: Arc<ErrorClassifier>,
        queue: &str,
        processor: JobProcessor,
        concurrency: usize,
    ) -> WorkerPool {
        let shutdown = CancellationToken::new();
        let handles = (0..concurrency.max(1))
            .map(|_| {
                let worker = QueueWorker::new(
                    self.clone(),
                    classifier.clone(),
                    queue,
                    processor.clone(),
                );
                let token = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = Box::new(worker).run(token).await {
                        error!(error = %e, "queue worker exited with error");
                    }
                })
            })
            .collect();
        WorkerPool { shutdown, handles }
    }
}
