//! Priority/delayed/retry job store over the durable KV adapter.
//!
//! Each queue owns three ordered sets and two hashes in the store:
//!
//! ```text
//! <queue>:waiting          zset  job id -> priority band + seq   (pop order)
//! <queue>:delayed          zset  job id -> eligibility epoch ms
//! <queue>:active           zset  job id -> claim epoch ms        (lease scan)
//! <queue>:jobs             hash  job id -> body (waiting/delayed/active)
//! <queue>:completed(/order) hash+zset  retained bounded
//! <queue>:failed(/order)    hash+zset  retained bounded
//! <queue>:seq              counter for FIFO tie-breaks
//! ```
//!
//! Claiming is lock-free: workers race on `zrem` from the waiting set and
//! exactly one wins each job. Jobs stuck in `active` past the lease are
//! reclaimed on the next claim pass, costing the job one attempt.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::common::{new_id, Clock};
use crate::error::Result;
use crate::kernel::EventHub;
use crate::kv::KvStore;
use crate::resilience::Classification;

use super::dead_letter::{DeadLetterEntry, DeadLetterQueue};
use super::events::{self, JobEvent};
use super::job::{Backoff, Job, JobCounts, JobOptions};

/// Retention bound for a terminal hash: keep at most `count` entries and
/// nothing older than `age`.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub count: u64,
    pub age: Duration,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub default_timeout_ms: u64,
    pub default_retries: u32,
    pub default_backoff: Backoff,
    /// How long a claimed job may sit in `active` before another worker may
    /// reclaim it.
    pub active_lease_ms: i64,
    pub completed_retention: Retention,
    pub failed_retention: Retention,
    /// Worker poll interval bounds when the queue is empty.
    pub min_poll_interval: Duration,
    pub max_poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            default_timeout_ms: 300_000,
            default_retries: 3,
            default_backoff: Backoff::default(),
            active_lease_ms: 60_000,
            completed_retention: Retention {
                count: 1_000,
                age: Duration::from_secs(24 * 60 * 60),
            },
            failed_retention: Retention {
                count: 5_000,
                age: Duration::from_secs(7 * 24 * 60 * 60),
            },
            min_poll_interval: Duration::from_millis(100),
            max_poll_interval: Duration::from_secs(1),
        }
    }
}

/// What `fail_job` did with the failure.
#[derive(Debug, Clone)]
pub enum FailOutcome {
    Retried { delay: Duration },
    DeadLettered { entry_id: Option<String> },
}

pub struct QueueService {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    hub: EventHub,
    config: QueueConfig,
    dlq: Option<Arc<DeadLetterQueue>>,
}

impl QueueService {
    pub fn new(
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        hub: EventHub,
        config: QueueConfig,
    ) -> Self {
        Self {
            kv,
            clock,
            hub,
            config,
            dlq: None,
        }
    }

    /// Attach the dead-letter store; exhausted jobs then produce entries.
    pub fn with_dead_letter(mut self, dlq: Arc<DeadLetterQueue>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    fn key(queue: &str, suffix: &str) -> String {
        format!("{queue}:{suffix}")
    }

    // Enqueue -----------------------------------------------------------

    /// Add a job, eligible immediately unless `opts.delay_ms` is set.
    pub async fn add_job(
        &self,
        queue: &str,
        name: &str,
        data: Value,
        opts: JobOptions,
    ) -> Result<Job> {
        let seq = self.kv.incr(&Self::key(queue, "seq")).await? as u64;
        let now = self.clock.now();
        let priority = Job::clamp_priority(opts.priority.unwrap_or(super::job::DEFAULT_WIRE_PRIORITY));
        let delay_ms = opts.delay_ms;

        let mut job = Job::builder()
            .id(new_id().to_string())
            .queue(queue)
            .name(name)
            .data(data)
            .priority(priority)
            .seq(seq)
            .max_attempts(opts.max_attempts.unwrap_or(self.config.default_retries).max(1))
            .backoff(opts.backoff.unwrap_or(self.config.default_backoff))
            .timeout_ms(opts.timeout_ms.unwrap_or(self.config.default_timeout_ms))
            .created_at(now)
            .build();
        job.task_id = opts.task_id;

        if let Some(delay) = delay_ms {
            job.scheduled_for = Some(now + chrono::Duration::milliseconds(delay as i64));
        }

        self.persist_body(&job).await?;
        match delay_ms {
            Some(delay) => {
                let eligible_at = self.clock.now_ms() + delay as i64;
                self.kv
                    .zadd(&Self::key(queue, "delayed"), &job.id, eligible_at as f64)
                    .await?;
            }
            None => {
                self.kv
                    .zadd(&Self::key(queue, "waiting"), &job.id, job.waiting_score())
                    .await?;
            }
        }

        debug!(job_id = %job.id, queue = %queue, name = %name, priority, "enqueued job");
        self.hub.publish_event(
            &events::topic(queue),
            &JobEvent::Enqueued {
                job_id: job.id.clone(),
                task_id: job.task_id,
                name: job.name.clone(),
                delayed_ms: delay_ms,
            },
        );
        Ok(job)
    }

    /// Add a job that becomes eligible at `now + delay_ms`.
    pub async fn add_delayed_job(
        &self,
        queue: &str,
        name: &str,
        data: Value,
        delay_ms: u64,
        mut opts: JobOptions,
    ) -> Result<Job> {
        opts.delay_ms = Some(delay_ms);
        self.add_job(queue, name, data, opts).await
    }

    /// Add a job with explicit per-job retry configuration.
    pub async fn add_job_with_retry(
        &self,
        queue: &str,
        name: &str,
        data: Value,
        attempts: u32,
        backoff: Backoff,
    ) -> Result<Job> {
        self.add_job(
            queue,
            name,
            data,
            JobOptions {
                max_attempts: Some(attempts),
                backoff: Some(backoff),
                ..Default::default()
            },
        )
        .await
    }

    async fn persist_body(&self, job: &Job) -> Result<()> {
        let body = serde_json::to_string(job)?;
        self.kv
            .hset(&Self::key(&job.queue, "jobs"), &job.id, &body)
            .await
    }

    // Introspection -----------------------------------------------------

    pub async fn get_job(&self, queue: &str, job_id: &str) -> Result<Option<Job>> {
        for hash in ["jobs", "completed", "failed"] {
            if let Some(body) = self.kv.hget(&Self::key(queue, hash), job_id).await? {
                return Ok(Some(serde_json::from_str(&body)?));
            }
        }
        Ok(None)
    }

    pub async fn get_job_counts(&self, queue: &str) -> Result<JobCounts> {
        Ok(JobCounts {
            waiting: self.kv.zcard(&Self::key(queue, "waiting")).await?,
            active: self.kv.zcard(&Self::key(queue, "active")).await?,
            delayed: self.kv.zcard(&Self::key(queue, "delayed")).await?,
            completed: self.kv.hlen(&Self::key(queue, "completed")).await?,
            failed: self.kv.hlen(&Self::key(queue, "failed")).await?,
        })
    }

    // Claiming ----------------------------------------------------------

    /// Claim the next ready job for `worker_id`, or `None` when the queue
    /// is drained. Promotes due delayed jobs and reclaims stale active jobs
    /// first so a single polling loop drives the whole lifecycle.
    pub async fn claim_next(&self, queue: &str, worker_id: &str) -> Result<Option<Job>> {
        self.promote_due_delayed(queue).await?;
        self.reclaim_stale_active(queue).await?;

        let waiting_key = Self::key(queue, "waiting");
        loop {
            let candidates = self
                .kv
                .zrange_by_score(&waiting_key, f64::MIN, f64::MAX, Some(1))
                .await?;
            let Some((job_id, _)) = candidates.into_iter().next() else {
                return Ok(None);
            };
            // Exactly one racing worker sees true here.
            if !self.kv.zrem(&waiting_key, &job_id).await? {
                continue;
            }

            let Some(body) = self.kv.hget(&Self::key(queue, "jobs"), &job_id).await? else {
                warn!(job_id = %job_id, queue = %queue, "waiting entry without body, dropping");
                continue;
            };
            let mut job: Job = serde_json::from_str(&body)?;
            let now = self.clock.now();
            job.started_at.get_or_insert(now);
            job.worker_id = Some(worker_id.to_string());
            self.persist_body(&job).await?;
            self.kv
                .zadd(&Self::key(queue, "active"), &job.id, self.clock.now_ms() as f64)
                .await?;

            self.hub.publish_event(
                &events::topic(queue),
                &JobEvent::Started {
                    job_id: job.id.clone(),
                    task_id: job.task_id,
                    name: job.name.clone(),
                    worker_id: worker_id.to_string(),
                    attempt: job.attempts + 1,
                },
            );
            return Ok(Some(job));
        }
    }

    async fn promote_due_delayed(&self, queue: &str) -> Result<()> {
        let delayed_key = Self::key(queue, "delayed");
        let due = self
            .kv
            .zrange_by_score(&delayed_key, f64::MIN, self.clock.now_ms() as f64, Some(64))
            .await?;
        for (job_id, _) in due {
            if !self.kv.zrem(&delayed_key, &job_id).await? {
                continue;
            }
            let Some(body) = self.kv.hget(&Self::key(queue, "jobs"), &job_id).await? else {
                continue;
            };
            let job: Job = serde_json::from_str(&body)?;
            self.kv
                .zadd(&Self::key(queue, "waiting"), &job_id, job.waiting_score())
                .await?;
            debug!(job_id = %job_id, queue = %queue, "promoted delayed job");
        }
        Ok(())
    }

    /// Jobs claimed longer ago than the lease are assumed orphaned by a
    /// dead worker; put them back in rotation at the cost of one attempt.
    async fn reclaim_stale_active(&self, queue: &str) -> Result<()> {
        let active_key = Self::key(queue, "active");
        let cutoff = self.clock.now_ms() - self.config.active_lease_ms;
        if cutoff <= 0 {
            return Ok(());
        }
        let stale = self
            .kv
            .zrange_by_score(&active_key, f64::MIN, cutoff as f64, Some(16))
            .await?;
        for (job_id, _) in stale {
            if !self.kv.zrem(&active_key, &job_id).await? {
                continue;
            }
            let Some(body) = self.kv.hget(&Self::key(queue, "jobs"), &job_id).await? else {
                continue;
            };
            let mut job: Job = serde_json::from_str(&body)?;
            warn!(
                job_id = %job.id,
                queue = %queue,
                old_worker = job.worker_id.as_deref().unwrap_or("unknown"),
                "reclaiming job with expired lease"
            );
            job.attempts += 1;
            job.worker_id = None;
            job.last_error = Some("worker lease expired".to_string());
            if job.has_attempts_left() {
                self.persist_body(&job).await?;
                self.kv
                    .zadd(&Self::key(queue, "waiting"), &job.id, job.waiting_score())
                    .await?;
            } else {
                self.move_to_failed(&mut job, "lease", "worker lease expired", false)
                    .await?;
            }
        }
        Ok(())
    }

    // Completion --------------------------------------------------------

    /// Record a successful run and retire the job into `completed`.
    pub async fn complete_job(&self, mut job: Job, result: Value) -> Result<()> {
        let queue = job.queue.clone();
        let now = self.clock.now();
        job.finished_at = Some(now);
        job.result = Some(result.clone());

        self.kv.zrem(&Self::key(&queue, "active"), &job.id).await?;
        self.kv.hdel(&Self::key(&queue, "jobs"), &job.id).await?;
        let body = serde_json::to_string(&job)?;
        self.kv
            .hset(&Self::key(&queue, "completed"), &job.id, &body)
            .await?;
        self.kv
            .zadd(
                &Self::key(&queue, "completed:order"),
                &job.id,
                self.clock.now_ms() as f64,
            )
            .await?;
        self.trim_terminal(&queue, "completed", self.config.completed_retention)
            .await?;

        let duration_ms = job
            .started_at
            .map(|s| (now - s).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        info!(job_id = %job.id, queue = %queue, duration_ms, "job completed");
        self.hub.publish_event(
            &events::topic(&queue),
            &JobEvent::Succeeded {
                job_id: job.id.clone(),
                task_id: job.task_id,
                name: job.name.clone(),
                result: Some(result),
                duration_ms,
            },
        );
        Ok(())
    }

    /// Record a failed run: re-enqueue with backoff while the classification
    /// allows and attempts remain, otherwise retire into `failed` and the DLQ.
    pub async fn fail_job(
        &self,
        mut job: Job,
        classification: &Classification,
    ) -> Result<FailOutcome> {
        let queue = job.queue.clone();
        job.attempts += 1;
        job.last_error = Some(classification.message.clone());

        let will_retry = classification.should_retry && job.has_attempts_left();
        if will_retry {
            let delay = job.backoff.delay_for(job.attempts);
            let eligible_at = self.clock.now_ms() + delay.as_millis() as i64;
            job.scheduled_for =
                Some(self.clock.now() + chrono::Duration::milliseconds(delay.as_millis() as i64));
            job.worker_id = None;
            self.persist_body(&job).await?;
            self.kv.zrem(&Self::key(&queue, "active"), &job.id).await?;
            self.kv
                .zadd(&Self::key(&queue, "delayed"), &job.id, eligible_at as f64)
                .await?;

            warn!(
                job_id = %job.id,
                queue = %queue,
                attempt = job.attempts,
                delay_ms = delay.as_millis() as u64,
                error = %classification.message,
                "job failed, retry scheduled"
            );
            self.hub.publish_event(
                &events::topic(&queue),
                &JobEvent::Failed {
                    job_id: job.id.clone(),
                    task_id: job.task_id,
                    name: job.name.clone(),
                    error: classification.message.clone(),
                    attempt: job.attempts,
                    will_retry: true,
                    retry_delay_ms: Some(delay.as_millis() as u64),
                },
            );
            return Ok(FailOutcome::Retried { delay });
        }

        let reason = failure_reason(classification);
        let entry_id = self
            .move_to_failed(
                &mut job,
                &reason,
                &classification.message,
                !classification.should_retry,
            )
            .await?;
        Ok(FailOutcome::DeadLettered { entry_id })
    }

    async fn move_to_failed(
        &self,
        job: &mut Job,
        reason: &str,
        error: &str,
        requires_manual_intervention: bool,
    ) -> Result<Option<String>> {
        let queue = job.queue.clone();
        job.finished_at = Some(self.clock.now());

        self.kv.zrem(&Self::key(&queue, "active"), &job.id).await?;
        self.kv.hdel(&Self::key(&queue, "jobs"), &job.id).await?;
        let body = serde_json::to_string(&job)?;
        self.kv
            .hset(&Self::key(&queue, "failed"), &job.id, &body)
            .await?;
        self.kv
            .zadd(
                &Self::key(&queue, "failed:order"),
                &job.id,
                self.clock.now_ms() as f64,
            )
            .await?;
        self.trim_terminal(&queue, "failed", self.config.failed_retention)
            .await?;

        warn!(
            job_id = %job.id,
            queue = %queue,
            attempts = job.attempts,
            error = %error,
            "job exhausted retries"
        );
        self.hub.publish_event(
            &events::topic(&queue),
            &JobEvent::Failed {
                job_id: job.id.clone(),
                task_id: job.task_id,
                name: job.name.clone(),
                error: error.to_string(),
                attempt: job.attempts,
                will_retry: false,
                retry_delay_ms: None,
            },
        );

        let mut entry_id = None;
        if let Some(dlq) = &self.dlq {
            let entry = DeadLetterEntry {
                entry_id: new_id().to_string(),
                job_id: job.id.clone(),
                task_id: job.task_id,
                queue: queue.clone(),
                task_name: job.name.clone(),
                payload: job.data.clone(),
                priority: job.priority,
                failure_reason: reason.to_string(),
                last_error: error.to_string(),
                attempts_made: job.attempts,
                enqueued_at: self.clock.now(),
                requires_manual_intervention,
                resolution: None,
                resolved_by: None,
                resolved_at: None,
            };
            entry_id = Some(entry.entry_id.clone());
            dlq.enqueue(entry).await?;
        }

        self.hub.publish_event(
            &events::topic(&queue),
            &JobEvent::DeadLettered {
                job_id: job.id.clone(),
                task_id: job.task_id,
                name: job.name.clone(),
                total_attempts: job.attempts,
                final_error: error.to_string(),
            },
        );
        Ok(entry_id)
    }

    async fn trim_terminal(&self, queue: &str, hash: &str, retention: Retention) -> Result<()> {
        let order_key = Self::key(queue, &format!("{hash}:order"));
        let hash_key = Self::key(queue, hash);

        // Age bound.
        let cutoff = self.clock.now_ms() - retention.age.as_millis() as i64;
        if cutoff > 0 {
            let expired = self
                .kv
                .zrange_by_score(&order_key, f64::MIN, cutoff as f64, None)
                .await?;
            for (job_id, _) in expired {
                self.kv.zrem(&order_key, &job_id).await?;
                self.kv.hdel(&hash_key, &job_id).await?;
            }
        }

        // Count bound: drop oldest beyond the cap.
        let size = self.kv.zcard(&order_key).await?;
        if size > retention.count {
            let excess = (size - retention.count) as usize;
            let oldest = self
                .kv
                .zrange_by_score(&order_key, f64::MIN, f64::MAX, Some(excess))
                .await?;
            for (job_id, _) in oldest {
                self.kv.zrem(&order_key, &job_id).await?;
                self.kv.hdel(&hash_key, &job_id).await?;
            }
        }
        Ok(())
    }

    /// Liveness of the backing store.
    pub async fn ping(&self) -> Result<()> {
        self.kv.ping().await
    }
}

/// Short reason tag used for DLQ grouping, derived from the classification
/// category.
pub fn failure_reason(classification: &Classification) -> String {
    use crate::resilience::ErrorCategory::*;
    match classification.category {
        Network => "network",
        Timeout => "timeout",
        FileSystem => "file_system",
        Validation => "validation",
        Authentication => "authentication",
        Configuration => "configuration",
        System => "system",
        Unknown => "unknown",
    }
    .to_string()
}

impl std::fmt::Debug for QueueService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
