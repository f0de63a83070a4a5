//! Strategy-driven self-healing with per-strategy cooldowns.

pub mod service;
pub mod strategy;

pub use service::{
    HealingOutcome, HealingRecord, HealingStats, SelfHealingConfig, SelfHealingService,
    HEALING_TOPIC,
};
pub use strategy::{ActionSpec, HealingAction, HealingStrategy};
