//! Checkpoint journal
//!
//! Durable, append-only log of step life-cycle points. The orchestrator
//! writes a record before and after every billable submit call and on every
//! terminal outcome; on restart the latest record per step decides whether
//! the step resumes polling, is already done, or needs operator review.

mod file;
mod memory;

pub use file::FileJournal;
pub use memory::MemoryJournal;

use async_trait::async_trait;
use mosaic_core::domain::checkpoint::CheckpointRecord;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// Journal errors
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("Journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Journal serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A record in the middle of the journal could not be decoded
    #[error("Journal corrupt at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
}

/// Append-only checkpoint store
///
/// Appends are serialized by the implementation; lookups are served from an
/// in-memory index of the latest record per step.
#[async_trait]
pub trait CheckpointJournal: Send + Sync {
    /// Durably appends a record
    async fn append(&self, record: CheckpointRecord) -> Result<(), JournalError>;

    /// Latest record for a step
    fn latest(&self, step_id: Uuid) -> Option<CheckpointRecord>;

    /// Latest record of every step belonging to a pipeline
    fn latest_for_pipeline(&self, pipeline_id: Uuid) -> HashMap<Uuid, CheckpointRecord>;

    /// Drops superseded records, keeping one per step; returns records kept
    async fn compact(&self) -> Result<usize, JournalError>;
}

/// Folds a record into a latest-per-step index
pub(crate) fn index_record(index: &mut HashMap<Uuid, CheckpointRecord>, record: CheckpointRecord) {
    index.insert(record.step_id, record);
}

pub(crate) fn pipeline_slice(
    index: &HashMap<Uuid, CheckpointRecord>,
    pipeline_id: Uuid,
) -> HashMap<Uuid, CheckpointRecord> {
    index
        .iter()
        .filter(|(_, record)| record.pipeline_id == pipeline_id)
        .map(|(id, record)| (*id, record.clone()))
        .collect()
}
