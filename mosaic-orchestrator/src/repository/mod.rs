//! Repository Module
//!
//! Data access layer for the orchestrator.
//! Each repository handles database operations for a specific table;
//! [`PgStore`] exposes them to the engine as a pipeline store.

pub mod pipeline;
pub mod step;
mod store;

// Re-export for convenience
pub use pipeline as pipeline_repository;
pub use step as step_repository;
pub use store::PgStore;
