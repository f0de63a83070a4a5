//! Injectable time source.
//!
//! Every component that reads the clock takes an `Arc<dyn Clock>` so tests
//! can drive TTLs, cooldowns and sliding windows deterministically. Nothing
//! in the core calls `Utc::now()` directly.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Duration since the clock was created. Monotonic, unaffected by
    /// wall-clock adjustments.
    fn monotonic(&self) -> Duration;

    /// Current wall-clock time as epoch milliseconds. Used for ordered-set
    /// scores in the durable store.
    fn now_ms(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Production clock backed by the OS.
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.monotonic();
        let b = clock.monotonic();
        assert!(b >= a);
    }

    #[test]
    fn now_ms_matches_now() {
        let clock = SystemClock::new();
        let now = clock.now().timestamp_millis();
        let ms = clock.now_ms();
        assert!((ms - now).abs() < 1_000);
    }
}
