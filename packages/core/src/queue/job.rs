//! Job model for the durable queue.
//!
//! A job is one queued execution attempt. Wire priority runs 1–10 with the
//! numerically lowest value most urgent (tasks map CRITICAL to 7, LOW to 10,
//! so critical work beats everything else on the queue). The waiting set is
//! scored so that more urgent jobs pop first and ties break FIFO by a
//! per-queue sequence number.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Priority band width in the waiting-set score. Sequence numbers below
/// 2^40 keep the combined score exact in an f64 (< 2^53).
const SEQ_BAND: f64 = (1u64 << 40) as f64;

pub const MIN_WIRE_PRIORITY: u8 = 1;
pub const MAX_WIRE_PRIORITY: u8 = 10;
pub const DEFAULT_WIRE_PRIORITY: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Exponential,
    Fixed,
}

/// Per-job retry backoff configuration. Exponential doubles the delay per
/// attempt; fixed repeats it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    pub kind: BackoffKind,
    pub delay_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay_ms: 1_000,
        }
    }
}

impl Backoff {
    /// Delay before the retry following `attempts` completed attempts.
    pub fn delay_for(&self, attempts: u32) -> std::time::Duration {
        match self.kind {
            BackoffKind::Exponential => crate::resilience::queue_backoff(
                self.delay_ms,
                attempts.saturating_sub(1),
                3_600_000,
            ),
            BackoffKind::Fixed => std::time::Duration::from_millis(self.delay_ms),
        }
    }
}

/// Options accepted when enqueuing a job.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Wire priority 1–10 (10 highest); clamped on enqueue.
    pub priority: Option<u8>,
    pub delay_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub backoff: Option<Backoff>,
    pub timeout_ms: Option<u64>,
    /// Task the job executes on behalf of, when submitted by the task queue.
    pub task_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub name: String,

    /// Opaque payload; the task queue stores its wire record here.
    pub data: Value,

    /// Task this job executes, when known. Carried on lifecycle events so
    /// the scheduler can map queue outcomes back onto tasks.
    #[builder(default, setter(strip_option))]
    pub task_id: Option<Uuid>,

    #[builder(default = DEFAULT_WIRE_PRIORITY)]
    pub priority: u8,
    /// FIFO tie-breaker within a priority band.
    pub seq: u64,

    #[builder(default = 0)]
    pub attempts: u32,
    #[builder(default = 3)]
    pub max_attempts: u32,
    #[builder(default)]
    pub backoff: Backoff,

    #[builder(default = 300_000)]
    pub timeout_ms: u64,

    #[builder(default, setter(strip_option))]
    pub scheduled_for: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub finished_at: Option<DateTime<Utc>>,

    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub last_error: Option<String>,
    #[builder(default, setter(strip_option))]
    pub result: Option<Value>,
}

impl Job {
    /// Score in the waiting set: lower pops first. The wire priority value
    /// is the band (lower value = more urgent); within a band the sequence
    /// keeps FIFO order.
    pub fn waiting_score(&self) -> f64 {
        let band = Self::clamp_priority(self.priority) as f64;
        band * SEQ_BAND + self.seq as f64
    }

    pub fn clamp_priority(priority: u8) -> u8 {
        priority.clamp(MIN_WIRE_PRIORITY, MAX_WIRE_PRIORITY)
    }

    /// Remaining retry budget after the current failure.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Counts reported per queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

impl JobCounts {
    pub fn total_backlog(&self) -> u64 {
        self.waiting + self.active + self.delayed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn job(priority: u8, seq: u64) -> Job {
        Job::builder()
            .id("job-1")
            .queue("aidos:tasks")
            .name("build")
            .data(serde_json::json!({}))
            .priority(priority)
            .seq(seq)
            .created_at(Utc::now())
            .build()
    }

    #[test]
    fn critical_band_scores_ahead_of_normal() {
        // CRITICAL tasks arrive as wire 7, NORMAL as wire 9; the critical
        // job pops first even when enqueued much later.
        let critical = job(7, 100);
        let normal = job(9, 1);
        assert!(critical.waiting_score() < normal.waiting_score());
    }

    #[test]
    fn same_priority_orders_fifo() {
        let first = job(5, 1);
        let second = job(5, 2);
        assert!(first.waiting_score() < second.waiting_score());
    }

    #[test]
    fn priority_clamps_to_wire_range() {
        assert_eq!(Job::clamp_priority(0), 1);
        assert_eq!(Job::clamp_priority(11), 10);
        assert_eq!(Job::clamp_priority(7), 7);
    }

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay_for(1).as_millis(), 1_000);
        assert_eq!(backoff.delay_for(2).as_millis(), 2_000);
        assert_eq!(backoff.delay_for(3).as_millis(), 4_000);
    }

    #[test]
    fn fixed_backoff_repeats() {
        let backoff = Backoff {
            kind: BackoffKind::Fixed,
            delay_ms: 500,
        };
        assert_eq!(backoff.delay_for(1).as_millis(), 500);
        assert_eq!(backoff.delay_for(4).as_millis(), 500);
    }

    #[test]
    fn job_serializes_roundtrip() {
        let job = job(7, 42);
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back.priority, 7);
        assert_eq!(back.seq, 42);
    }
}
