//! Trait seams for external collaborators.
//!
//! The core never talks to notification transports or the host shell
//! directly; it goes through these traits so the API layer can wire real
//! implementations and tests can observe what would have been sent or run.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Outcome of a remediation command run by the host.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Executes shell commands and scripts on behalf of the self-healing
/// service. Implementations own sandboxing and environment concerns.
#[async_trait]
pub trait BaseCommandRunner: Send + Sync {
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput>;
}

/// Delivers human-facing notifications (alert routing, healing reports,
/// user-error surfacing). Transports live outside the core.
#[async_trait]
pub trait BaseNotifier: Send + Sync {
    async fn notify(&self, channel: &str, subject: &str, body: &str) -> Result<()>;
}

/// Long-running background component driven by the host until shutdown.
///
/// Implementations must watch the token and drain their current unit of
/// work before returning.
#[async_trait]
pub trait Service: Send {
    fn name(&self) -> &'static str;

    async fn run(self: Box<Self>, shutdown: tokio_util::sync::CancellationToken) -> Result<()>;
}
