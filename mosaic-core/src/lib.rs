//! Mosaic Core
//!
//! Core types and abstractions for the Mosaic bulk generation system.
//!
//! This crate contains:
//! - Domain types: Core business entities (Pipeline, Step, checkpoint records)
//! - DTOs: Data transfer objects (bulk requests, status views, progress events, cost estimates)

pub mod domain;
pub mod dto;
