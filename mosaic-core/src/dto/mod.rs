//! Data Transfer Objects for inter-service communication
//!
//! This module contains DTOs used between the orchestrator, its HTTP surface,
//! the client and the CLI. DTOs are lightweight representations of domain
//! entities optimized for network transfer.

pub mod cost;
pub mod event;
pub mod pipeline;
