//! # Aidos execution core
//!
//! The subsystem that turns a requirement into reliably executed work:
//! a durable priority queue with retries and idempotency, a dependency-aware
//! task scheduler, a typed agent pool, a resilience layer and three-tier
//! monitoring feeding alerting and self-healing.
//!
//! ```text
//! Scheduler.add_task ─► schedule_task ─► TaskQueue ─► QueueService (KV)
//!        ▲                                                 │
//!        │ job events (hub)                                ▼
//!        └───────────────◄──────────────── Worker ─► IdempotencyService
//!                                             │            │
//!                        Classifier ◄── failure            ▼
//!                            │                        AgentPool.execute
//!              retry (delayed set) / DLQ
//!
//! Monitors ─► SmartAlertService ─► SelfHealingService ─► CommandRunner
//! ```
//!
//! Everything ambient travels in a [`kernel::CoreContext`]; there are no
//! global singletons. The durable KV store is the only cross-worker
//! synchronization point. The HTTP API, notification transports and
//! concrete agent implementations live outside this crate and connect
//! through the traits in [`kernel::traits`] and [`pool::AgentExecutor`].

pub mod common;
pub mod config;
mod core;
pub mod error;
pub mod guardian;
pub mod healing;
pub mod kernel;
pub mod kv;
pub mod monitoring;
pub mod pool;
pub mod queue;
pub mod resilience;
pub mod scheduler;

pub use config::CoreConfig;
pub use crate::core::Core;
pub use error::{CoreError, Result};
pub use kernel::CoreContext;

/// Initialize tracing with an `RUST_LOG`-style env filter. Used by hosts
/// and ignored if a subscriber is already installed.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
