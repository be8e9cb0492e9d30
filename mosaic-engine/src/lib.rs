//! Mosaic engine
//!
//! Fans bulk generation requests out into steps and drives them against
//! external providers.
//!
//! Architecture:
//! - Expansion: bulk request validation, step expansion and cost estimates
//! - Resilience: error classification, retry policy, rate limiting and model cooldowns
//! - Durability: checkpoint journal and pipeline store
//! - Scheduler: bounded submit/poll pools and crash recovery

pub mod classifier;
pub mod config;
pub mod cooldown;
pub mod error;
pub mod expander;
pub mod journal;
pub mod pricing;
pub mod provider;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod validation;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use scheduler::Orchestrator;
