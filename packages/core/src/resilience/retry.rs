//! Exponential-backoff retry policy.
//!
//! `delay(attempt) = min(base * multiplier^attempt, max_delay) * jitter`,
//! with jitter uniform in `[0.5, 1.5)` when enabled. `execute` retries a
//! closure for classifications whose level sits in the configured retryable
//! set; everything else fails fast. Observers receive an `Attempt` event
//! before each wait and an `Exhausted` event when retries run out.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::Result;

use super::classifier::{Classification, ErrorClassifier, ErrorLevel};

#[derive(Debug, Clone)]
pub struct RetryPolicyConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_retries: u32,
    pub jitter: bool,
    /// Levels that are retried by `execute`. Operational errors go through
    /// the recovery hook instead of the backoff loop.
    pub retryable_levels: Vec<ErrorLevel>,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_retries: 3,
            jitter: true,
            retryable_levels: vec![ErrorLevel::Recoverable],
        }
    }
}

/// Decision returned by [`RetryPolicy::should_retry`].
#[derive(Debug, Clone)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Option<Duration>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub enum RetryEvent {
    /// Emitted before each backoff wait.
    Attempt {
        attempt: u32,
        error: String,
        delay: Duration,
        max_retries: u32,
    },
    /// Emitted once when retries are exhausted.
    Exhausted { attempts: u32, error: String },
}

type RetryListener = Box<dyn Fn(&RetryEvent) + Send + Sync>;

pub struct RetryPolicy {
    config: RetryPolicyConfig,
    classifier: Arc<ErrorClassifier>,
    listeners: Mutex<Vec<RetryListener>>,
}

impl RetryPolicy {
    pub fn new(config: RetryPolicyConfig, classifier: Arc<ErrorClassifier>) -> Self {
        Self {
            config,
            classifier,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn with_defaults(classifier: Arc<ErrorClassifier>) -> Self {
        Self::new(RetryPolicyConfig::default(), classifier)
    }

    /// Subscribe to retry lifecycle events. Listeners must not block.
    pub fn on_event(&self, listener: RetryListener) {
        self.listeners.lock().push(listener);
    }

    fn emit(&self, event: RetryEvent) {
        for listener in self.listeners.lock().iter() {
            listener(&event);
        }
    }

    /// Backoff before the retry following `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential =
            self.config.base_delay.as_millis() as f64 * self.config.multiplier.powi(attempt as i32);
        let capped = exponential.min(self.config.max_delay.as_millis() as f64);
        let factor = if self.config.jitter {
            rand::thread_rng().gen_range(0.5..1.5)
        } else {
            1.0
        };
        Duration::from_millis((capped * factor) as u64)
    }

    /// Whether the failure at `attempt` (zero-based) should be retried.
    pub fn should_retry(&self, classification: &Classification, attempt: u32) -> RetryDecision {
        if !self.config.retryable_levels.contains(&classification.level) {
            return RetryDecision {
                retry: false,
                delay: None,
                reason: Some(format!("level {:?} is not retryable", classification.level)),
            };
        }
        if !classification.should_retry {
            return RetryDecision {
                retry: false,
                delay: None,
                reason: Some("classification forbids retry".to_string()),
            };
        }
        let max = self.config.max_retries.min(classification.max_retries.max(1));
        if attempt >= max {
            return RetryDecision {
                retry: false,
                delay: None,
                reason: Some(format!("exhausted {max} retries")),
            };
        }
        RetryDecision {
            retry: true,
            delay: Some(self.delay(attempt)),
            reason: None,
        }
    }

    /// Run `f`, retrying per the policy. Operational failures invoke the
    /// classifier's recovery hook once before the retry decision.
    pub async fn execute<T, F, Fut>(&self, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let classification = self.classifier.classify(&error);
                    if classification.level == ErrorLevel::Operational {
                        if let Err(recovery_err) = self.classifier.recover(&classification) {
                            warn!(error = %recovery_err, "operational recovery hook failed");
                        }
                    }

                    let decision = self.should_retry(&classification, attempt);
                    match decision.delay {
                        Some(delay) if decision.retry => {
                            self.emit(RetryEvent::Attempt {
                                attempt,
                                error: classification.message.clone(),
                                delay,
                                max_retries: self.config.max_retries,
                            });
                            debug!(
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %classification.message,
                                "retrying after backoff"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        _ => {
                            self.emit(RetryEvent::Exhausted {
                                attempts: attempt + 1,
                                error: classification.message.clone(),
                            });
                            return Err(error);
                        }
                    }
                }
            }
        }
    }
}

/// Backoff used by the durable queue for failed jobs: no jitter, so delays
/// are reproducible from the job record alone.
pub fn queue_backoff(base_delay_ms: u64, attempts: u32, max_delay_ms: u64) -> Duration {
    let exponential = (base_delay_ms as f64) * 2f64.powi(attempts as i32);
    Duration::from_millis(exponential.min(max_delay_ms as f64) as u64)
}
