//! Durable progress for named migrations.
//!
//! One JSON file per job:
//! `{ "cursor": <opaque>, "stats": {..}, "batchNumber": n, "timestamp": epoch-ms }`,
//! plus `pendingRetry` when whole-batch writes behind the cursor still await
//! their retry.
//! Written after every page's writes, deleted when the job completes.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::stats::MigrationStats;
use crate::common::fs::write_atomic_async;
use crate::kernel::{Cursor, Item};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Next scan position; absent means "from the start".
    #[serde(default, alias = "lastKey", skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    pub stats: MigrationStats,
    pub batch_number: u64,
    /// Epoch milliseconds
    pub timestamp: i64,
    /// Destination items from failed batches the cursor has already passed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_retry: Vec<Item>,
}

impl Checkpoint {
    pub fn new(cursor: Option<Cursor>, stats: MigrationStats, batch_number: u64) -> Self {
        Self {
            cursor,
            stats,
            batch_number,
            timestamp: Utc::now().timestamp_millis(),
            pending_retry: Vec::new(),
        }
    }

    pub fn with_pending_retry(mut self, items: Vec<Item>) -> Self {
        self.pending_retry = items;
        self
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint at {location} is corrupt: {source}")]
    Corrupt {
        location: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize checkpoint: {0}")]
    Serialization(#[source] serde_json::Error),
}

/// Persistence for checkpoints, keyed by job name. Single writer per job.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, job: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    async fn save(&self, job: &str, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Remove the checkpoint. Clearing a missing checkpoint is not an error.
    async fn clear(&self, job: &str) -> Result<(), CheckpointError>;

    /// Human-readable location, for logs and summaries.
    fn location(&self, job: &str) -> String;
}

/// `{dir}/{job}-checkpoint.json`, replaced atomically on every save.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, job: &str) -> PathBuf {
        self.dir.join(format!("{}-checkpoint.json", job))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, job: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path(job);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| CheckpointError::Corrupt {
                location: path.display().to_string(),
                source,
            })
    }

    async fn save(&self, job: &str, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let bytes =
            serde_json::to_vec_pretty(checkpoint).map_err(CheckpointError::Serialization)?;
        write_atomic_async(self.path(job), bytes).await?;
        Ok(())
    }

    async fn clear(&self, job: &str) -> Result<(), CheckpointError> {
        match tokio::fs::remove_file(self.path(job)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn location(&self, job: &str) -> String {
        self.path(job).display().to_string()
    }
}

/// In-memory checkpoints for tests, with injectable save failures.
#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Arc<Mutex<HashMap<String, Checkpoint>>>,
    fail_saves: Arc<AtomicBool>,
    saves: Arc<AtomicUsize>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoint(self, job: &str, checkpoint: Checkpoint) -> Self {
        self.checkpoints
            .lock()
            .unwrap()
            .insert(job.to_string(), checkpoint);
        self
    }

    /// Make every subsequent save fail with an io error.
    pub fn with_failing_saves(self) -> Self {
        self.fail_saves.store(true, Ordering::SeqCst);
        self
    }

    pub fn get(&self, job: &str) -> Option<Checkpoint> {
        self.checkpoints.lock().unwrap().get(job).cloned()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, job: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.get(job))
    }

    async fn save(&self, job: &str, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(CheckpointError::Io(std::io::Error::new(
                ErrorKind::Other,
                "no space left on device",
            )));
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.checkpoints
            .lock()
            .unwrap()
            .insert(job.to_string(), checkpoint.clone());
        Ok(())
    }

    async fn clear(&self, job: &str) -> Result<(), CheckpointError> {
        self.checkpoints.lock().unwrap().remove(job);
        Ok(())
    }

    fn location(&self, job: &str) -> String {
        format!("memory://{}", job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_file_format_is_camel_case() {
        let mut stats = MigrationStats {
            total: 500,
            migrated: 480,
            skipped: 20,
            ..Default::default()
        };
        stats.bump("retried", 2);
        let checkpoint = Checkpoint {
            cursor: Some(Cursor(json!({"PK": "X", "SK": ""}))),
            stats,
            batch_number: 3,
            timestamp: 1_700_000_000_000,
            pending_retry: Vec::new(),
        };

        let value = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(value["batchNumber"], 3);
        assert_eq!(value["cursor"]["PK"], "X");
        assert_eq!(value["stats"]["retried"], 2);
        assert_eq!(value["timestamp"], 1_700_000_000_000i64);
        assert!(value.get("pendingRetry").is_none());
    }

    #[test]
    fn test_pending_retry_items_survive_a_round_trip() {
        let item = Item::from_json(json!({"PK": "WIDGET#w1", "SK": "WIDGET", "item": {"id": "w1"}}))
            .unwrap();
        let checkpoint =
            Checkpoint::new(None, MigrationStats::default(), 1).with_pending_retry(vec![item.clone()]);

        let value = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(value["pendingRetry"][0]["PK"], "WIDGET#w1");
        assert_eq!(value["pendingRetry"][0]["item"]["id"], "w1");

        let restored: Checkpoint = serde_json::from_value(value).unwrap();
        assert_eq!(restored.pending_retry, vec![item]);
    }

    #[test]
    fn test_reads_legacy_last_key_files() {
        let checkpoint: Checkpoint = serde_json::from_value(json!({
            "lastKey": {"id": "abc"},
            "stats": {"total": 10, "migrated": 8, "skipped": 1, "errors": 1},
            "batchNumber": 2,
            "timestamp": 1
        }))
        .unwrap();
        assert_eq!(checkpoint.cursor, Some(Cursor(json!({"id": "abc"}))));
        assert_eq!(checkpoint.stats.errors, 1);
    }

    #[tokio::test]
    async fn test_file_store_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        assert!(store.load("migrate_drafts").await.unwrap().is_none());

        let checkpoint = Checkpoint::new(None, MigrationStats::default(), 1);
        store.save("migrate_drafts", &checkpoint).await.unwrap();
        assert!(dir.path().join("migrate_drafts-checkpoint.json").exists());
        assert_eq!(store.load("migrate_drafts").await.unwrap(), Some(checkpoint));

        store.clear("migrate_drafts").await.unwrap();
        store.clear("migrate_drafts").await.unwrap();
        assert!(store.load("migrate_drafts").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        std::fs::write(store.path("job"), "{not json").unwrap();
        let err = store.load("job").await.unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
    }
}
