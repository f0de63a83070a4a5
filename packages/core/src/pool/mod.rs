//! Typed agent pool: registration, capability matching and assignment.

pub mod agent;
#[allow(clippy::module_inception)]
pub mod pool;

pub use agent::{Agent, AgentStatus, AgentType, CompletedTask};
pub use pool::{
    AgentExecutor, AgentPool, AgentPoolConfig, AssignmentStrategy, PoolEvent, POOL_TOPIC,
};
