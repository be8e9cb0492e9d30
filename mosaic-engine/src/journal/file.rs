//! JSON-lines journal file
//!
//! One record per line, fsynced on every append. On open the file is replayed
//! into the latest-record index; a torn trailing line left by a crash is cut
//! off, anything malformed before it is reported as corruption.
//!
//! A failed append is rolled back to the last durable length so later records
//! never land behind a partial line.

use async_trait::async_trait;
use mosaic_core::domain::checkpoint::CheckpointRecord;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use super::{CheckpointJournal, JournalError, index_record, pipeline_slice};

/// File-backed checkpoint journal
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    writer: tokio::sync::Mutex<Writer>,
    index: Mutex<HashMap<Uuid, CheckpointRecord>>,
}

/// Append handle plus the length of its durable prefix
#[derive(Debug)]
struct Writer {
    file: File,
    /// Bytes holding complete, synced records
    committed: u64,
    /// A failed append may have left bytes past `committed`
    dirty: bool,
}

impl Writer {
    fn new(file: File, committed: u64) -> Self {
        Self {
            file,
            committed,
            dirty: false,
        }
    }

    async fn truncate_to_committed(&mut self) -> std::io::Result<()> {
        self.file.set_len(self.committed).await?;
        self.file.sync_data().await?;
        self.dirty = false;
        Ok(())
    }

    async fn append(&mut self, line: &[u8]) -> std::io::Result<()> {
        if self.dirty {
            self.truncate_to_committed().await?;
        }

        let result = match self.file.write_all(line).await {
            Ok(()) => self.file.sync_data().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.committed += line.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.dirty = true;
                if let Err(rollback) = self.truncate_to_committed().await {
                    warn!("Could not roll back partial journal append: {}", rollback);
                }
                Err(e)
            }
        }
    }
}

impl FileJournal {
    /// Opens (or creates) the journal at `path` and replays it
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();

        let contents = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let replay = replay(&contents)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        if replay.valid_len < contents.len() {
            warn!(
                "Discarding {} byte(s) of torn trailing record in {}",
                contents.len() - replay.valid_len,
                path.display()
            );
            file.set_len(replay.valid_len as u64).await?;
            file.sync_all().await?;
        }

        info!(
            "Opened checkpoint journal {} ({} records, {} steps)",
            path.display(),
            replay.records,
            replay.index.len()
        );

        Ok(Self {
            path,
            writer: tokio::sync::Mutex::new(Writer::new(file, replay.valid_len as u64)),
            index: Mutex::new(replay.index),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CheckpointJournal for FileJournal {
    async fn append(&self, record: CheckpointRecord) -> Result<(), JournalError> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        self.writer.lock().await.append(&line).await?;

        // Index only after the record is durable
        index_record(&mut self.index.lock(), record);
        Ok(())
    }

    fn latest(&self, step_id: Uuid) -> Option<CheckpointRecord> {
        self.index.lock().get(&step_id).cloned()
    }

    fn latest_for_pipeline(&self, pipeline_id: Uuid) -> HashMap<Uuid, CheckpointRecord> {
        pipeline_slice(&self.index.lock(), pipeline_id)
    }

    async fn compact(&self) -> Result<usize, JournalError> {
        let mut writer = self.writer.lock().await;

        let mut records: Vec<CheckpointRecord> = self.index.lock().values().cloned().collect();
        records.sort_by_key(|r| r.timestamp);

        let mut buf = Vec::new();
        for record in &records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let tmp_path = self.path.with_extension("compact");
        let mut tmp = File::create(&tmp_path).await?;
        tmp.write_all(&buf).await?;
        tmp.sync_all().await?;
        drop(tmp);

        tokio::fs::rename(&tmp_path, &self.path).await?;

        let file = OpenOptions::new().append(true).open(&self.path).await?;
        *writer = Writer::new(file, buf.len() as u64);

        info!("Compacted checkpoint journal {} to {} records", self.path.display(), records.len());
        Ok(records.len())
    }
}

struct Replay {
    index: HashMap<Uuid, CheckpointRecord>,
    records: usize,
    /// Byte length of the well-formed prefix
    valid_len: usize,
}

fn replay(contents: &[u8]) -> Result<Replay, JournalError> {
    let mut index = HashMap::new();
    let mut records = 0;
    let mut offset = 0;
    let mut line_no = 0;

    while offset < contents.len() {
        line_no += 1;
        let rest = &contents[offset..];

        let Some(newline) = rest.iter().position(|b| *b == b'\n') else {
            // Unterminated fragment: the append was interrupted
            break;
        };

        let line = &rest[..newline];
        let next = offset + newline + 1;

        if line.iter().all(u8::is_ascii_whitespace) {
            offset = next;
            continue;
        }

        match serde_json::from_slice::<CheckpointRecord>(line) {
            Ok(record) => {
                index_record(&mut index, record);
                records += 1;
                offset = next;
            }
            Err(_) if next >= contents.len() => {
                // Last line garbled: treat it like a torn append
                break;
            }
            Err(e) => {
                return Err(JournalError::Corrupt {
                    line: line_no,
                    reason: e.to_string(),
                });
            }
        }
    }

    Ok(Replay {
        index,
        records,
        valid_len: offset,
    })
}
