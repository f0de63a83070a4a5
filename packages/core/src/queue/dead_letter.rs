//! Dead-letter queue.
//!
//! Jobs that exhaust retries (or fail non-retryably) land here with enough
//! context to diagnose and replay them. Entries persist in the KV store:
//! a hash of bodies keyed by entry id, an ordered set by enqueue time (the
//! DLQ preserves failure order) and a per-task index for lookups by task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::common::Clock;
use crate::error::{CoreError, Result};
use crate::kv::KvStore;

use super::job::JobOptions;
use super::service::QueueService;

const ENTRIES_KEY: &str = "aidos:dlq:entries";
const ORDER_KEY: &str = "aidos:dlq:order";

fn task_index_key(task_id: &Uuid) -> String {
    format!("aidos:dlq:by-task:{task_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DlqResolution {
    Requeued,
    Discarded,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub entry_id: String,
    pub job_id: String,
    pub task_id: Option<Uuid>,
    /// Queue the job came from; requeue submits back here.
    pub queue: String,
    pub task_name: String,
    /// Original payload, preserved byte-for-byte for replay.
    pub payload: Value,
    pub priority: u8,
    pub failure_reason: String,
    pub last_error: String,
    pub attempts_made: u32,
    pub enqueued_at: DateTime<Utc>,
    pub requires_manual_intervention: bool,
    pub resolution: Option<DlqResolution>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DeadLetterEntry {
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Filter for [`DeadLetterQueue::list`]. Empty filter returns everything.
#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    pub task_id: Option<Uuid>,
    pub requires_manual_intervention: Option<bool>,
    pub unresolved_only: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DlqStats {
    pub total_entries: u64,
    pub pending_manual_intervention: u64,
    pub by_reason: HashMap<String, u64>,
}

pub struct DeadLetterQueue {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
}

impl DeadLetterQueue {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self { kv, clock }
    }

    pub async fn enqueue(&self, entry: DeadLetterEntry) -> Result<()> {
        let body = serde_json::to_string(&entry)?;
        self.kv.hset(ENTRIES_KEY, &entry.entry_id, &body).await?;
        self.kv
            .zadd(
                ORDER_KEY,
                &entry.entry_id,
                entry.enqueued_at.timestamp_millis() as f64,
            )
            .await?;
        if let Some(task_id) = &entry.task_id {
            self.kv
                .zadd(
                    &task_index_key(task_id),
                    &entry.entry_id,
                    entry.enqueued_at.timestamp_millis() as f64,
                )
                .await?;
        }
        info!(
            entry_id = %entry.entry_id,
            job_id = %entry.job_id,
            reason = %entry.failure_reason,
            "job dead-lettered"
        );
        Ok(())
    }

    pub async fn get(&self, entry_id: &str) -> Result<Option<DeadLetterEntry>> {
        match self.kv.hget(ENTRIES_KEY, entry_id).await? {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    /// Entries in failure order, optionally filtered.
    pub async fn list(&self, filter: Option<DlqFilter>) -> Result<Vec<DeadLetterEntry>> {
        let filter = filter.unwrap_or_default();
        let ordered = match &filter.task_id {
            Some(task_id) => {
                self.kv
                    .zrange_by_score(&task_index_key(task_id), f64::MIN, f64::MAX, None)
                    .await?
            }
            None => {
                self.kv
                    .zrange_by_score(ORDER_KEY, f64::MIN, f64::MAX, None)
                    .await?
            }
        };

        let mut out = Vec::with_capacity(ordered.len());
        for (entry_id, _) in ordered {
            let Some(entry) = self.get(&entry_id).await? else {
                continue;
            };
            if let Some(manual) = filter.requires_manual_intervention {
                if entry.requires_manual_intervention != manual {
                    continue;
                }
            }
            if filter.unresolved_only && entry.is_resolved() {
                continue;
            }
            out.push(entry);
        }
        Ok(out)
    }

    pub async fn count(&self) -> Result<u64> {
        self.kv.zcard(ORDER_KEY).await
    }

    /// Record a resolution on an entry. Requeueing is done via [`Self::requeue`];
    /// this method covers `Discarded` and `Resolved`.
    pub async fn resolve(
        &self,
        entry_id: &str,
        resolution: DlqResolution,
        resolved_by: &str,
    ) -> Result<DeadLetterEntry> {
        let mut entry = self
            .get(entry_id)
            .await?
            .ok_or_else(|| CoreError::DlqEntryNotFound(entry_id.to_string()))?;
        entry.resolution = Some(resolution);
        entry.resolved_by = Some(resolved_by.to_string());
        entry.resolved_at = Some(self.clock.now());
        let body = serde_json::to_string(&entry)?;
        self.kv.hset(ENTRIES_KEY, entry_id, &body).await?;
        info!(entry_id = %entry_id, resolution = ?resolution, resolved_by, "dlq entry resolved");
        Ok(entry)
    }

    /// Re-submit the original payload as a fresh job (attempts reset) and
    /// mark the entry requeued. Returns the new job id.
    pub async fn requeue(&self, entry_id: &str, queue: &QueueService) -> Result<String> {
        let entry = self
            .get(entry_id)
            .await?
            .ok_or_else(|| CoreError::DlqEntryNotFound(entry_id.to_string()))?;
        if entry.is_resolved() {
            return Err(CoreError::Validation(format!(
                "dlq entry {entry_id} is already resolved"
            )));
        }

        let job = queue
            .add_job(
                &entry.queue,
                &entry.task_name,
                entry.payload.clone(),
                JobOptions {
                    priority: Some(entry.priority),
                    task_id: entry.task_id,
                    ..Default::default()
                },
            )
            .await?;

        self.resolve(entry_id, DlqResolution::Requeued, "dlq:requeue")
            .await?;
        queue.hub().publish_event(
            &super::events::topic(&entry.queue),
            &super::events::JobEvent::Requeued {
                job_id: job.id.clone(),
                entry_id: entry_id.to_string(),
                task_id: entry.task_id,
            },
        );
        Ok(job.id)
    }

    pub async fn get_stats(&self) -> Result<DlqStats> {
        let entries = self.list(None).await?;
        let mut stats = DlqStats {
            total_entries: entries.len() as u64,
            ..Default::default()
        };
        for entry in entries {
            if entry.requires_manual_intervention && !entry.is_resolved() {
                stats.pending_manual_intervention += 1;
            }
            *stats.by_reason.entry(entry.failure_reason).or_insert(0) += 1;
        }
        Ok(stats)
    }

    /// Drop entries older than `max_age`. Opt-in housekeeping; nothing calls
    /// this automatically.
    pub async fn cleanup_older_than(&self, max_age: Duration) -> Result<u64> {
        let cutoff = self.clock.now_ms() - max_age.as_millis() as i64;
        if cutoff <= 0 {
            return Ok(0);
        }
        let expired = self
            .kv
            .zrange_by_score(ORDER_KEY, f64::MIN, cutoff as f64, None)
            .await?;
        let mut removed = 0;
        for (entry_id, _) in expired {
            if let Some(entry) = self.get(&entry_id).await? {
                if let Some(task_id) = &entry.task_id {
                    self.kv.zrem(&task_index_key(task_id), &entry_id).await?;
                }
            }
            self.kv.zrem(ORDER_KEY, &entry_id).await?;
            if self.kv.hdel(ENTRIES_KEY, &entry_id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_dependencies::ManualClock;
    use crate::kernel::EventHub;
    use crate::kv::MemoryKv;
    use crate::queue::service::QueueConfig;
    use serde_json::json;

    fn fixture() -> (Arc<ManualClock>, DeadLetterQueue, QueueService) {
        let clock = Arc::new(ManualClock::new());
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new(clock.clone()));
        let dlq = DeadLetterQueue::new(kv.clone(), clock.clone());
        let queue = QueueService::new(kv, clock.clone(), EventHub::new(), QueueConfig::default());
        (clock, dlq, queue)
    }

    fn entry(clock: &ManualClock, entry_id: &str, reason: &str, manual: bool) -> DeadLetterEntry {
        DeadLetterEntry {
            entry_id: entry_id.to_string(),
            job_id: format!("job-{entry_id}"),
            task_id: Some(Uuid::new_v4()),
            queue: "aidos:tasks".to_string(),
            task_name: "build".to_string(),
            payload: json!({"taskName": "build", "payload": {"n": 1}}),
            priority: 6,
            failure_reason: reason.to_string(),
            last_error: "ETIMEDOUT".to_string(),
            attempts_made: 2,
            enqueued_at: clock.now(),
            requires_manual_intervention: manual,
            resolution: None,
            resolved_by: None,
            resolved_at: None,
        }
    }

    #[tokio::test]
    async fn enqueue_and_list_preserve_failure_order() {
        let (clock, dlq, _) = fixture();
        dlq.enqueue(entry(&clock, "e1", "timeout", false)).await.unwrap();
        clock.advance(Duration::from_secs(1));
        dlq.enqueue(entry(&clock, "e2", "network", false)).await.unwrap();

        let listed = dlq.list(None).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].entry_id, "e1");
        assert_eq!(listed[1].entry_id, "e2");
    }

    #[tokio::test]
    async fn list_filters_by_task_and_manual_flag() {
        let (clock, dlq, _) = fixture();
        let mut manual = entry(&clock, "manual", "validation", true);
        let task_id = Uuid::new_v4();
        manual.task_id = Some(task_id);
        dlq.enqueue(manual).await.unwrap();
        dlq.enqueue(entry(&clock, "auto", "timeout", false)).await.unwrap();

        let by_task = dlq
            .list(Some(DlqFilter {
                task_id: Some(task_id),
                ..Default::default()
            }))
            .await
            .unwrap();
        assert_eq!(by_task.len(), 1);
        assert_eq!(by_task[0].entry_id, "manual");

        let manual_only = dlq
            .list(Some(DlqFilter {
                requires_manual_intervention: Some(true),
                ..Default::default()
            }))
            .await
            .unwrap();
        assert_eq!(manual_only.len(), 1);
    }

    #[tokio::test]
    async fn resolve_records_who_and_when() {
        let (clock, dlq, _) = fixture();
        dlq.enqueue(entry(&clock, "e1", "timeout", false)).await.unwrap();

        let resolved = dlq
            .resolve("e1", DlqResolution::Discarded, "ops@example")
            .await
            .unwrap();
        assert_eq!(resolved.resolution, Some(DlqResolution::Discarded));
        assert_eq!(resolved.resolved_by.as_deref(), Some("ops@example"));
        assert!(resolved.resolved_at.is_some());
    }

    #[tokio::test]
    async fn resolve_unknown_entry_errors() {
        let (_, dlq, _) = fixture();
        let err = dlq
            .resolve("missing", DlqResolution::Resolved, "ops")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DlqEntryNotFound(_)));
    }

    #[tokio::test]
    async fn requeue_preserves_payload_and_resets_attempts() {
        let (clock, dlq, queue) = fixture();
        let original = entry(&clock, "e1", "timeout", false);
        let payload = original.payload.clone();
        let task_id = original.task_id;
        dlq.enqueue(original).await.unwrap();

        let job_id = dlq.requeue("e1", &queue).await.unwrap();
        let job = queue
            .get_job("aidos:tasks", &job_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.data, payload);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.task_id, task_id);

        let entry = dlq.get("e1").await.unwrap().unwrap();
        assert_eq!(entry.resolution, Some(DlqResolution::Requeued));
    }

    #[tokio::test]
    async fn requeue_twice_is_rejected() {
        let (clock, dlq, queue) = fixture();
        dlq.enqueue(entry(&clock, "e1", "timeout", false)).await.unwrap();
        dlq.requeue("e1", &queue).await.unwrap();
        assert!(dlq.requeue("e1", &queue).await.is_err());
    }

    #[tokio::test]
    async fn stats_group_by_reason() {
        let (clock, dlq, _) = fixture();
        dlq.enqueue(entry(&clock, "e1", "timeout", false)).await.unwrap();
        dlq.enqueue(entry(&clock, "e2", "timeout", true)).await.unwrap();
        dlq.enqueue(entry(&clock, "e3", "network", false)).await.unwrap();

        let stats = dlq.get_stats().await.unwrap();
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.pending_manual_intervention, 1);
        assert_eq!(stats.by_reason.get("timeout"), Some(&2));
        assert_eq!(stats.by_reason.get("network"), Some(&1));
    }

    #[tokio::test]
    async fn cleanup_drops_only_old_entries() {
        let (clock, dlq, _) = fixture();
        dlq.enqueue(entry(&clock, "old", "timeout", false)).await.unwrap();
        clock.advance(Duration::from_secs(31 * 24 * 60 * 60));
        dlq.enqueue(entry(&clock, "new", "timeout", false)).await.unwrap();

        let removed = dlq
            .cleanup_older_than(Duration::from_secs(30 * 24 * 60 * 60))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(dlq.get("old").await.unwrap().is_none());
        assert!(dlq.get("new").await.unwrap().is_some());
    }
}
