//! Error classification.
//!
//! Maps raw failure text onto a small taxonomy that the rest of the core
//! keys retry and surfacing decisions off:
//!
//! - `Operational` (L1): local condition, auto-fixable, one retry.
//! - `Recoverable` (L2): transient, retry with backoff.
//! - `UserInput` / `Auth` (L3): surface immediately, never retry.
//! - `Fatal` (L4): initiate the shutdown path.
//!
//! Rules are applied in order, first match wins: user-registered patterns
//! before the built-in table, and a defaulting rule at the end so every
//! error classifies.

use std::fmt::Display;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::{new_id, Clock};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorLevel {
    /// L1: local operational hiccup.
    Operational,
    /// L2: transient, worth retrying with backoff.
    Recoverable,
    /// L3: the caller's input is wrong.
    UserInput,
    /// L3: credentials or permissions are wrong.
    Auth,
    /// L4: the process is compromised.
    Fatal,
}

impl ErrorLevel {
    /// Default retry behavior for the level: `(should_retry, max_retries)`.
    pub fn retry_defaults(&self) -> (bool, u32) {
        match self {
            ErrorLevel::Operational => (true, 1),
            ErrorLevel::Recoverable => (true, 3),
            ErrorLevel::UserInput | ErrorLevel::Auth | ErrorLevel::Fatal => (false, 0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Network,
    Timeout,
    FileSystem,
    Validation,
    Authentication,
    Configuration,
    System,
    Unknown,
}

/// The classifier's verdict for one raw error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub id: Uuid,
    pub level: ErrorLevel,
    pub category: ErrorCategory,
    pub should_retry: bool,
    pub max_retries: u32,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

struct Rule {
    pattern: Regex,
    level: ErrorLevel,
    category: ErrorCategory,
}

impl Rule {
    fn new(pattern: &str, level: ErrorLevel, category: ErrorCategory) -> Self {
        Self {
            pattern: Regex::new(&format!("(?i){pattern}")).expect("built-in pattern compiles"),
            level,
            category,
        }
    }
}

lazy_static! {
    static ref BUILTIN_RULES: Vec<Rule> = vec![
        Rule::new(
            "ECONNREFUSED|ENOTFOUND|ECONNRESET|EPIPE",
            ErrorLevel::Recoverable,
            ErrorCategory::Network,
        ),
        Rule::new("ETIMEDOUT|timeout", ErrorLevel::Recoverable, ErrorCategory::Timeout),
        Rule::new(
            "ENOENT|EBUSY|EMFILE",
            ErrorLevel::Recoverable,
            ErrorCategory::FileSystem,
        ),
        Rule::new(
            "validation|invalid|malformed",
            ErrorLevel::UserInput,
            ErrorCategory::Validation,
        ),
        Rule::new(
            "401|403|unauthorized|forbidden",
            ErrorLevel::Auth,
            ErrorCategory::Authentication,
        ),
        Rule::new(
            "config|missing.*config",
            ErrorLevel::Operational,
            ErrorCategory::Configuration,
        ),
        Rule::new(
            "fatal|SIGSEGV|out of memory|ENOMEM",
            ErrorLevel::Fatal,
            ErrorCategory::System,
        ),
        Rule::new("429|rate.limit", ErrorLevel::Recoverable, ErrorCategory::Network),
    ];
}

/// Recovery hook invoked for L1 (operational) classifications.
pub type RecoveryHook = Box<dyn Fn(&Classification) -> Result<()> + Send + Sync>;

pub struct ErrorClassifier {
    clock: Arc<dyn Clock>,
    custom_rules: RwLock<Vec<Rule>>,
    recovery_hook: RwLock<Option<RecoveryHook>>,
}

impl ErrorClassifier {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            custom_rules: RwLock::new(Vec::new()),
            recovery_hook: RwLock::new(None),
        }
    }

    /// Register a user pattern checked before the built-in table.
    /// Invalid regexes are rejected.
    pub fn register_pattern(
        &self,
        pattern: &str,
        level: ErrorLevel,
        category: ErrorCategory,
    ) -> Result<()> {
        let compiled = Regex::new(&format!("(?i){pattern}"))
            .map_err(|e| crate::error::CoreError::Validation(format!("bad pattern: {e}")))?;
        self.custom_rules.write().push(Rule {
            pattern: compiled,
            level,
            category,
        });
        Ok(())
    }

    /// Register the L1 recovery function. The default is a no-op success.
    pub fn set_recovery_hook(&self, hook: RecoveryHook) {
        *self.recovery_hook.write() = Some(hook);
    }

    /// Classify any displayable error.
    pub fn classify(&self, error: &dyn Display) -> Classification {
        self.classify_message(&error.to_string())
    }

    pub fn classify_message(&self, message: &str) -> Classification {
        let custom = self.custom_rules.read();
        let matched = custom
            .iter()
            .chain(BUILTIN_RULES.iter())
            .find(|rule| rule.pattern.is_match(message));

        let (level, category) = match matched {
            Some(rule) => (rule.level, rule.category),
            None => (ErrorLevel::Operational, ErrorCategory::Unknown),
        };
        let (should_retry, max_retries) = match matched {
            Some(_) => level.retry_defaults(),
            // Unmatched errors get one conservative retry.
            None => (true, 1),
        };

        Classification {
            id: new_id(),
            level,
            category,
            should_retry,
            max_retries,
            message: message.to_string(),
            timestamp: self.clock.now(),
        }
    }

    /// Run the registered L1 recovery function for an operational
    /// classification. No hook means recovery trivially succeeds.
    pub fn recover(&self, classification: &Classification) -> Result<()> {
        if classification.level != ErrorLevel::Operational {
            return Ok(());
        }
        match self.recovery_hook.read().as_ref() {
            Some(hook) => hook(classification),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SystemClock;

    fn classifier() -> ErrorClassifier {
        ErrorClassifier::new(Arc::new(SystemClock::new()))
    }

    #[test]
    fn connection_refused_is_recoverable_network() {
        let c = classifier().classify_message("connect ECONNREFUSED 127.0.0.1:6379");
        assert_eq!(c.level, ErrorLevel::Recoverable);
        assert_eq!(c.category, ErrorCategory::Network);
        assert!(c.should_retry);
        assert_eq!(c.max_retries, 3);
    }

    #[test]
    fn timeout_is_recoverable_timeout() {
        let c = classifier().classify_message("operation timed out after 5000ms: ETIMEDOUT");
        assert_eq!(c.level, ErrorLevel::Recoverable);
        assert_eq!(c.category, ErrorCategory::Timeout);
    }

    #[test]
    fn classification_is_case_insensitive() {
        let c = classifier().classify_message("Request TIMEOUT while fetching");
        assert_eq!(c.category, ErrorCategory::Timeout);
    }

    #[test]
    fn validation_never_retries() {
        let c = classifier().classify_message("validation error: name is required");
        assert_eq!(c.level, ErrorLevel::UserInput);
        assert!(!c.should_retry);
        assert_eq!(c.max_retries, 0);
    }

    #[test]
    fn unauthorized_is_auth() {
        let c = classifier().classify_message("401 unauthorized");
        assert_eq!(c.level, ErrorLevel::Auth);
        assert_eq!(c.category, ErrorCategory::Authentication);
    }

    #[test]
    fn missing_config_is_operational() {
        let c = classifier().classify_message("missing database config");
        assert_eq!(c.level, ErrorLevel::Operational);
        assert_eq!(c.category, ErrorCategory::Configuration);
        assert!(c.should_retry);
        assert_eq!(c.max_retries, 1);
    }

    #[test]
    fn out_of_memory_is_fatal() {
        let c = classifier().classify_message("ENOMEM: out of memory");
        assert_eq!(c.level, ErrorLevel::Fatal);
        assert_eq!(c.category, ErrorCategory::System);
        assert!(!c.should_retry);
    }

    #[test]
    fn rate_limit_is_recoverable_network() {
        let c = classifier().classify_message("429 rate limit exceeded");
        assert_eq!(c.level, ErrorLevel::Recoverable);
        assert_eq!(c.category, ErrorCategory::Network);
    }

    #[test]
    fn unknown_error_defaults_to_operational_with_one_retry() {
        let c = classifier().classify_message("something odd happened");
        assert_eq!(c.level, ErrorLevel::Operational);
        assert_eq!(c.category, ErrorCategory::Unknown);
        assert!(c.should_retry);
        assert_eq!(c.max_retries, 1);
    }

    #[test]
    fn custom_pattern_wins_over_builtin() {
        let classifier = classifier();
        classifier
            .register_pattern("quota exceeded", ErrorLevel::Fatal, ErrorCategory::System)
            .unwrap();
        // "timeout" would normally match the built-in table; the custom
        // rule is checked first.
        classifier
            .register_pattern("timeout", ErrorLevel::UserInput, ErrorCategory::Validation)
            .unwrap();
        let c = classifier.classify_message("timeout waiting for quota");
        assert_eq!(c.level, ErrorLevel::UserInput);
    }

    #[test]
    fn invalid_custom_pattern_is_rejected() {
        let classifier = classifier();
        assert!(classifier
            .register_pattern("([unclosed", ErrorLevel::Fatal, ErrorCategory::System)
            .is_err());
    }

    #[test]
    fn recovery_hook_runs_for_operational_only() {
        let classifier = classifier();
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let seen = counter.clone();
        classifier.set_recovery_hook(Box::new(move |_| {
            seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }));

        let op = classifier.classify_message("weird unknown error");
        classifier.recover(&op).unwrap();
        let fatal = classifier.classify_message("fatal crash");
        classifier.recover(&fatal).unwrap();

        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn recovery_without_hook_succeeds() {
        let classifier = classifier();
        let c = classifier.classify_message("anything");
        assert!(classifier.recover(&c).is_ok());
    }
}
