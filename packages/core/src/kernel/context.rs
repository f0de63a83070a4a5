//! CoreContext: the explicit dependency container.
//!
//! Everything ambient (clock, durable store, metrics, alerts, event hub,
//! notifier, command runner) travels in one context object handed to
//! constructors; there are no process-wide singletons. Tests build a
//! context over `MemoryKv`, a manual clock and mock collaborators.

use std::sync::Arc;

use crate::common::{Clock, SystemClock};
use crate::kv::{KvStore, MemoryKv};
use crate::monitoring::{MetricsService, SmartAlertService};

use super::event_hub::EventHub;
use super::test_dependencies::TestDependencies;
use super::traits::{BaseCommandRunner, BaseNotifier};

#[derive(Clone)]
pub struct CoreContext {
    pub clock: Arc<dyn Clock>,
    pub kv: Arc<dyn KvStore>,
    pub hub: EventHub,
    pub metrics: Arc<MetricsService>,
    pub alerts: Arc<SmartAlertService>,
    pub notifier: Arc<dyn BaseNotifier>,
    pub command_runner: Arc<dyn BaseCommandRunner>,
}

impl CoreContext {
    pub fn new(
        clock: Arc<dyn Clock>,
        kv: Arc<dyn KvStore>,
        notifier: Arc<dyn BaseNotifier>,
        command_runner: Arc<dyn BaseCommandRunner>,
    ) -> Self {
        let hub = EventHub::new();
        let metrics = Arc::new(MetricsService::with_defaults(clock.clone()));
        let alerts = Arc::new(SmartAlertService::with_defaults(clock.clone(), hub.clone()));
        Self {
            clock,
            kv,
            hub,
            metrics,
            alerts,
            notifier,
            command_runner,
        }
    }

    /// Production context over a real clock and the given store.
    pub fn with_system_clock(
        kv: Arc<dyn KvStore>,
        notifier: Arc<dyn BaseNotifier>,
        command_runner: Arc<dyn BaseCommandRunner>,
    ) -> Self {
        Self::new(Arc::new(SystemClock::new()), kv, notifier, command_runner)
    }

    /// Test context: manual clock, in-memory store, recording mocks.
    /// Returns the deps so tests can advance time and inspect mocks.
    pub fn for_tests() -> (Self, TestDependencies) {
        let deps = TestDependencies::new();
        let clock: Arc<dyn Clock> = deps.clock.clone();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new(clock.clone()));
        let context = Self::new(clock, kv, deps.notifier.clone(), deps.command_runner.clone());
        (context, deps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_context_shares_one_clock() {
        let (context, deps) = CoreContext::for_tests();
        let before = context.clock.now();
        deps.clock.advance(Duration::from_secs(10));
        assert_eq!((context.clock.now() - before).num_seconds(), 10);
    }

    #[tokio::test]
    async fn test_context_kv_roundtrips() {
        let (context, _deps) = CoreContext::for_tests();
        context.kv.set("k", "v", None).await.unwrap();
        assert_eq!(context.kv.get("k").await.unwrap(), Some("v".to_string()));
    }
}
