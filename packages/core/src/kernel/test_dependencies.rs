//! Mock collaborators for tests.
//!
//! `ManualClock` steps time explicitly so TTLs, cooldowns and windows are
//! deterministic. The mocks record every interaction for assertions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;

use crate::common::Clock;
use crate::error::Result;

use super::traits::{BaseCommandRunner, BaseNotifier, CommandOutput};

/// Deterministic clock advanced explicitly by tests.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    /// Starts at a fixed, readable instant.
    pub fn new() -> Self {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Self::starting_at(start)
    }

    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += ChronoDuration::from_std(by).expect("advance fits in chrono range");
        *self.elapsed.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    fn monotonic(&self) -> Duration {
        *self.elapsed.lock()
    }
}

/// Records notifications instead of delivering them.
#[derive(Default)]
pub struct MockNotifier {
    sent: Mutex<Vec<(String, String, String)>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, String, String)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl BaseNotifier for MockNotifier {
    async fn notify(&self, channel: &str, subject: &str, body: &str) -> Result<()> {
        self.sent
            .lock()
            .push((channel.to_string(), subject.to_string(), body.to_string()));
        Ok(())
    }
}

/// Scripted command runner: commands succeed unless a failure is queued.
#[derive(Default)]
pub struct MockCommandRunner {
    executed: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
}

impl MockCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every run of `command` fail with a non-zero status.
    pub fn fail_command(&self, command: &str) {
        self.failures.lock().push(command.to_string());
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }
}

#[async_trait]
impl BaseCommandRunner for MockCommandRunner {
    async fn run(&self, command: &str, _timeout: Duration) -> Result<CommandOutput> {
        self.executed.lock().push(command.to_string());
        if self.failures.lock().iter().any(|f| f == command) {
            return Ok(CommandOutput {
                status: 1,
                stdout: String::new(),
                stderr: format!("mock failure for: {command}"),
            });
        }
        Ok(CommandOutput {
            status: 0,
            stdout: format!("mock ok: {command}"),
            stderr: String::new(),
        })
    }
}

/// Convenience bundle used by unit and integration tests.
pub struct TestDependencies {
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<MockNotifier>,
    pub command_runner: Arc<MockCommandRunner>,
}

impl TestDependencies {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(ManualClock::new()),
            notifier: Arc::new(MockNotifier::new()),
            command_runner: Arc::new(MockCommandRunner::new()),
        }
    }
}

impl Default for TestDependencies {
    fn default() -> Self {
        Self::new()
    }
}
