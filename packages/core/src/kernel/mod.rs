//! Kernel: infrastructure only, no domain logic.
//!
//! Holds the dependency container ([`CoreContext`]), the event hub, the
//! trait seams for external collaborators and the mocks tests wire in
//! their place.

pub mod context;
pub mod event_hub;
pub mod test_dependencies;
pub mod traits;

pub use context::CoreContext;
pub use event_hub::{Envelope, EventHub, EventStream};
pub use test_dependencies::{ManualClock, MockCommandRunner, MockNotifier, TestDependencies};
pub use traits::{BaseCommandRunner, BaseNotifier, CommandOutput, Service};
