//! Process guardian: health-check loop with bounded restart.
//!
//! State machine: STARTING → RUNNING ↔ UNHEALTHY → RESTARTING, ending in
//! FAILED once restart attempts are exhausted or STOPPED on shutdown. A
//! successful restart resets the attempt counter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::kernel::{EventHub, Service};

pub const GUARDIAN_TOPIC: &str = "guardian";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuardianState {
    Starting,
    Running,
    Unhealthy,
    Restarting,
    Failed,
    Stopped,
}

impl GuardianState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, GuardianState::Failed | GuardianState::Stopped)
    }
}

#[derive(Debug, Clone)]
pub struct GuardianConfig {
    pub health_check_interval: Duration,
    pub max_restart_attempts: u32,
    pub restart_delay: Duration,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            max_restart_attempts: 3,
            restart_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GuardianTransition {
    pub from: GuardianState,
    pub to: GuardianState,
    pub restart_attempts: u32,
}

pub type HealthCheckFn = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;
pub type RestartFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

type TransitionListener = Box<dyn Fn(&GuardianTransition) + Send + Sync>;

pub struct ProcessGuardian {
    config: GuardianConfig,
    hub: EventHub,
    health_check: HealthCheckFn,
    restart: RestartFn,
    state: Arc<Mutex<GuardianState>>,
    listeners: Arc<Mutex<Vec<TransitionListener>>>,
}

impl ProcessGuardian {
    pub fn new(
        config: GuardianConfig,
        hub: EventHub,
        health_check: HealthCheckFn,
        restart: RestartFn,
    ) -> Self {
        Self {
            config,
            hub,
            health_check,
            restart,
            state: Arc::new(Mutex::new(GuardianState::Starting)),
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn state(&self) -> GuardianState {
        *self.state.lock()
    }

    /// Handle for observing state from outside while the guardian runs.
    pub fn state_handle(&self) -> Arc<Mutex<GuardianState>> {
        self.state.clone()
    }

    pub fn on_transition<F>(&self, listener: F)
    where
        F: Fn(&GuardianTransition) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Box::new(listener));
    }

    async fn transition(&self, to: GuardianState, restart_attempts: u32) {
        let from = {
            let mut state = self.state.lock();
            let from = *state;
            *state = to;
            from
        };
        if from == to {
            return;
        }
        info!(from = ?from, to = ?to, restart_attempts, "guardian state change");
        let transition = GuardianTransition {
            from,
            to,
            restart_attempts,
        };
        for listener in self.listeners.lock().iter() {
            listener(&transition);
        }
        self.hub.publish_event(GUARDIAN_TOPIC, &transition);
    }
}

#[async_trait]
impl Service for ProcessGuardian {
    fn name(&self) -> &'static str {
        "process-guardian"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut restart_attempts: u32 = 0;
        self.transition(GuardianState::Running, restart_attempts).await;

        let mut interval = tokio::time::interval(self.config.health_check_interval);
        interval.tick().await; // immediate first tick

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.transition(GuardianState::Stopped, restart_attempts).await;
                    return Ok(());
                }
                _ = interval.tick() => {}
            }

            let healthy = (self.health_check)().await;
            if healthy {
                if self.state() != GuardianState::Running {
                    restart_attempts = 0;
                    self.transition(GuardianState::Running, restart_attempts).await;
                }
                continue;
            }

            self.transition(GuardianState::Unhealthy, restart_attempts).await;
            if restart_attempts >= self.config.max_restart_attempts {
                error!(
                    attempts = restart_attempts,
                    "restart attempts exhausted, giving up"
                );
                self.transition(GuardianState::Failed, restart_attempts).await;
                return Ok(());
            }

            restart_attempts += 1;
            self.transition(GuardianState::Restarting, restart_attempts).await;
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.transition(GuardianState::Stopped, restart_attempts).await;
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.restart_delay) => {}
            }

            match (self.restart)().await {
                Ok(()) => {
                    info!(attempt = restart_attempts, "restart succeeded");
                    restart_attempts = 0;
                    self.transition(GuardianState::Running, restart_attempts).await;
                }
                Err(e) => {
                    warn!(attempt = restart_attempts, error = %e, "restart failed");
                    // Stay unhealthy; the next tick re-evaluates.
                    self.transition(GuardianState::Unhealthy, restart_attempts).await;
                }
            }
        }
    }
}
