//! In-memory journal for tests and ephemeral runs

use async_trait::async_trait;
use mosaic_core::domain::checkpoint::CheckpointRecord;
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use super::{CheckpointJournal, JournalError, index_record, pipeline_slice};

#[derive(Debug, Default)]
struct Inner {
    records: Vec<CheckpointRecord>,
    index: HashMap<Uuid, CheckpointRecord>,
}

/// Journal that keeps every record in memory
#[derive(Debug, Default)]
pub struct MemoryJournal {
    inner: Mutex<Inner>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record appended so far, in append order
    pub fn records(&self) -> Vec<CheckpointRecord> {
        self.inner.lock().records.clone()
    }

    /// Records of one step, in append order
    pub fn records_for(&self, step_id: Uuid) -> Vec<CheckpointRecord> {
        self.inner
            .lock()
            .records
            .iter()
            .filter(|r| r.step_id == step_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CheckpointJournal for MemoryJournal {
    async fn append(&self, record: CheckpointRecord) -> Result<(), JournalError> {
        let mut inner = self.inner.lock();
        inner.records.push(record.clone());
        index_record(&mut inner.index, record);
        Ok(())
    }

    fn latest(&self, step_id: Uuid) -> Option<CheckpointRecord> {
        self.inner.lock().index.get(&step_id).cloned()
    }

    fn latest_for_pipeline(&self, pipeline_id: Uuid) -> HashMap<Uuid, CheckpointRecord> {
        pipeline_slice(&self.inner.lock().index, pipeline_id)
    }

    async fn compact(&self) -> Result<usize, JournalError> {
        let mut inner = self.inner.lock();
        let mut kept: Vec<CheckpointRecord> = inner.index.values().cloned().collect();
        kept.sort_by_key(|r| r.timestamp);
        inner.records = kept;
        Ok(inner.records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mosaic_core::domain::checkpoint::CheckpointPhase;

    #[tokio::test]
    async fn test_latest_wins() {
        let journal = MemoryJournal::new();
        let pipeline_id = Uuid::new_v4();
        let step_id = Uuid::new_v4();

        journal
            .append(CheckpointRecord::new(
                pipeline_id,
                step_id,
                CheckpointPhase::SubmitStarted,
            ))
            .await
            .unwrap();
        journal
            .append(CheckpointRecord::new(
                pipeline_id,
                step_id,
                CheckpointPhase::Done {
                    outputs: vec!["a.png".to_string()],
                },
            ))
            .await
            .unwrap();

        assert_eq!(journal.latest(step_id).unwrap().phase.name(), "done");
        assert_eq!(journal.records_for(step_id).len(), 2);

        assert_eq!(journal.compact().await.unwrap(), 1);
        assert_eq!(journal.records().len(), 1);
    }
}
