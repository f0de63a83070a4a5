//! Sliding-window error budget.
//!
//! Tracks success/error outcomes inside a rolling time window and raises a
//! callback when the error count crosses the warning, error or critical
//! threshold. Alerts for the same level are rate-limited by a cooldown so a
//! sustained failure storm produces one alert per level per cooldown period.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::common::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BudgetLevel {
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone)]
pub struct ErrorBudgetConfig {
    pub time_window: Duration,
    /// Error count inside the window that degrades health.
    pub warning_threshold: u32,
    pub error_threshold: u32,
    /// Critical threshold = `error_threshold * critical_multiplier`.
    pub critical_multiplier: f64,
    pub alert_cooldown: Duration,
}

impl Default for ErrorBudgetConfig {
    fn default() -> Self {
        Self {
            time_window: Duration::from_secs(60),
            warning_threshold: 5,
            error_threshold: 10,
            critical_multiplier: 2.0,
            alert_cooldown: Duration::from_secs(30),
        }
    }
}

/// Snapshot handed to alert callbacks.
#[derive(Debug, Clone)]
pub struct BudgetAlert {
    pub level: BudgetLevel,
    pub error_count: u32,
    pub error_percentage: f64,
    pub window: Duration,
}

type BudgetListener = Box<dyn Fn(&BudgetAlert) + Send + Sync>;

struct Sample {
    at: DateTime<Utc>,
    is_error: bool,
}

pub struct ErrorBudget {
    config: ErrorBudgetConfig,
    clock: Arc<dyn Clock>,
    samples: Mutex<VecDeque<Sample>>,
    last_alert: Mutex<HashMap<BudgetLevel, DateTime<Utc>>>,
    listeners: Mutex<Vec<BudgetListener>>,
}

impl ErrorBudget {
    pub fn new(config: ErrorBudgetConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            samples: Mutex::new(VecDeque::new()),
            last_alert: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn on_alert(&self, listener: BudgetListener) {
        self.listeners.lock().push(listener);
    }

    pub fn record_success(&self) {
        self.record(false);
    }

    pub fn record_error(&self) {
        self.record(true);
        self.evaluate();
    }

    fn record(&self, is_error: bool) {
        let now = self.clock.now();
        let mut samples = self.samples.lock();
        samples.push_back(Sample { at: now, is_error });
        self.prune(&mut samples, now);
    }

    fn prune(&self, samples: &mut VecDeque<Sample>, now: DateTime<Utc>) {
        let cutoff = now
            - chrono::Duration::from_std(self.config.time_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        while samples.front().map(|s| s.at < cutoff).unwrap_or(false) {
            samples.pop_front();
        }
    }

    /// Error count inside the current window.
    pub fn get_error_rate(&self) -> u32 {
        let now = self.clock.now();
        let mut samples = self.samples.lock();
        self.prune(&mut samples, now);
        samples.iter().filter(|s| s.is_error).count() as u32
    }

    /// Errors as a percentage of all samples in the window; 0 when empty.
    pub fn get_error_percentage(&self) -> f64 {
        let now = self.clock.now();
        let mut samples = self.samples.lock();
        self.prune(&mut samples, now);
        if samples.is_empty() {
            return 0.0;
        }
        let errors = samples.iter().filter(|s| s.is_error).count();
        errors as f64 / samples.len() as f64 * 100.0
    }

    pub fn is_healthy(&self) -> bool {
        self.get_error_rate() < self.config.warning_threshold
    }

    fn critical_threshold(&self) -> u32 {
        (self.config.error_threshold as f64 * self.config.critical_multiplier) as u32
    }

    fn evaluate(&self) {
        let rate = self.get_error_rate();
        let level = if rate >= self.critical_threshold() {
            Some(BudgetLevel::Critical)
        } else if rate >= self.config.error_threshold {
            Some(BudgetLevel::Error)
        } else if rate >= self.config.warning_threshold {
            Some(BudgetLevel::Warning)
        } else {
            None
        };

        let Some(level) = level else { return };

        let now = self.clock.now();
        {
            let mut last = self.last_alert.lock();
            if let Some(previous) = last.get(&level) {
                let cooldown = chrono::Duration::from_std(self.config.alert_cooldown)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30));
                if now - *previous < cooldown {
                    return;
                }
            }
            last.insert(level, now);
        }

        let alert = BudgetAlert {
            level,
            error_count: rate,
            error_percentage: self.get_error_percentage(),
            window: self.config.time_window,
        };
        for listener in self.listeners.lock().iter() {
            listener(&alert);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_dependencies::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn budget(clock: Arc<ManualClock>) -> ErrorBudget {
        ErrorBudget::new(
            ErrorBudgetConfig {
                time_window: Duration::from_secs(60),
                warning_threshold: 3,
                error_threshold: 5,
                critical_multiplier: 2.0,
                alert_cooldown: Duration::from_secs(30),
            },
            clock,
        )
    }

    #[test]
    fn empty_budget_is_healthy() {
        let budget = budget(Arc::new(ManualClock::new()));
        assert!(budget.is_healthy());
        assert_eq!(budget.get_error_rate(), 0);
        assert_eq!(budget.get_error_percentage(), 0.0);
    }

    #[test]
    fn errors_outside_window_are_forgotten() {
        let clock = Arc::new(ManualClock::new());
        let budget = budget(clock.clone());

        for _ in 0..4 {
            budget.record_error();
        }
        assert!(!budget.is_healthy());

        clock.advance(Duration::from_secs(61));
        assert_eq!(budget.get_error_rate(), 0);
        assert!(budget.is_healthy());
    }

    #[test]
    fn percentage_counts_successes() {
        let budget = budget(Arc::new(ManualClock::new()));
        budget.record_success();
        budget.record_error();
        assert_eq!(budget.get_error_percentage(), 50.0);
    }

    #[test]
    fn alert_fires_once_per_cooldown() {
        let clock = Arc::new(ManualClock::new());
        let budget = budget(clock.clone());
        let alerts = Arc::new(AtomicU32::new(0));
        let seen = alerts.clone();
        budget.on_alert(Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        for _ in 0..4 {
            budget.record_error();
        }
        assert_eq!(alerts.load(Ordering::SeqCst), 1);

        // Still inside cooldown: no second warning alert.
        budget.record_error();
        clock.advance(Duration::from_secs(31));
        budget.record_error();
        assert!(alerts.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn escalates_to_critical_level() {
        let clock = Arc::new(ManualClock::new());
        let budget = budget(clock.clone());
        let critical = Arc::new(AtomicU32::new(0));
        let seen = critical.clone();
        budget.on_alert(Box::new(move |alert| {
            if alert.level == BudgetLevel::Critical {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }));

        for _ in 0..10 {
            budget.record_error();
        }
        assert_eq!(critical.load(Ordering::SeqCst), 1);
    }
}
