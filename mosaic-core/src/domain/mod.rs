//! Core domain types
//!
//! This module contains the core domain structures used across Mosaic crates.
//! These types represent the fundamental business entities and are shared between
//! the engine (execution), the orchestrator (persistence) and the client.

pub mod checkpoint;
pub mod pipeline;
pub mod step;
