//! Store backed by a JSON snapshot file, for running jobs against local dumps.
//!
//! Snapshot layout: `{ "<table>": [ { "PK": .., "SK": .., ...attrs }, .. ], .. }`.
//! Legacy dumps may omit `PK` and carry `id` instead.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::error::StoreResult;
use super::memory_store::MemoryStore;
use super::traits::BaseStoreClient;
use super::types::{Attributes, Cursor, Item, PrimaryKey, ScanPage, WriteAck};
use crate::common::fs::write_atomic_async;

pub struct FileStore {
    path: PathBuf,
    inner: MemoryStore,
    flush_lock: Mutex<()>,
}

impl FileStore {
    /// Load the snapshot at `path`, or start empty if it does not exist yet.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let inner = MemoryStore::new();

        if tokio::fs::try_exists(&path).await? {
            let raw = tokio::fs::read_to_string(&path).await?;
            let tables: BTreeMap<String, Vec<Value>> = serde_json::from_str(&raw)?;
            for (table, rows) in tables {
                let count = rows.len();
                inner.seed(&table, rows).await?;
                debug!(table = %table, count, "Loaded table from snapshot");
            }
            info!(path = %path.display(), "Opened store snapshot");
        } else {
            info!(path = %path.display(), "Store snapshot not found, starting empty");
        }

        Ok(Self {
            path,
            inner,
            flush_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist the current contents atomically.
    pub async fn flush(&self) -> StoreResult<()> {
        let _guard = self.flush_lock.lock().await;
        let tables = self.inner.dump().await;
        let bytes = serde_json::to_vec_pretty(&tables)?;
        write_atomic_async(self.path.clone(), bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl BaseStoreClient for FileStore {
    async fn scan(
        &self,
        table: &str,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> StoreResult<ScanPage> {
        self.inner.scan(table, cursor, limit).await
    }

    async fn get(&self, table: &str, key: &PrimaryKey) -> StoreResult<Option<Item>> {
        self.inner.get(table, key).await
    }

    async fn batch_get(&self, table: &str, keys: &[PrimaryKey]) -> StoreResult<Vec<Item>> {
        self.inner.batch_get(table, keys).await
    }

    async fn batch_write(&self, table: &str, items: Vec<Item>) -> StoreResult<WriteAck> {
        let ack = self.inner.batch_write(table, items).await?;
        self.flush().await?;
        Ok(ack)
    }

    async fn batch_delete(&self, table: &str, keys: Vec<PrimaryKey>) -> StoreResult<WriteAck> {
        let ack = self.inner.batch_delete(table, keys).await?;
        self.flush().await?;
        Ok(ack)
    }

    async fn query(&self, table: &str, partition: &str) -> StoreResult<Vec<Item>> {
        self.inner.query(table, partition).await
    }

    async fn update(
        &self,
        table: &str,
        key: &PrimaryKey,
        changes: Attributes,
    ) -> StoreResult<Item> {
        let item = self.inner.update(table, key, changes).await?;
        self.flush().await?;
        Ok(item)
    }
}
