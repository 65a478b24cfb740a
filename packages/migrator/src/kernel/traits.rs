// Trait definitions for dependency injection
//
// These are INFRASTRUCTURE traits only. Job logic (transforms, index
// derivation) lives in data_migrations and talks to storage through these.
//
// Naming convention: Base* for trait names (e.g., BaseStoreClient, BaseBlobStore)

use async_trait::async_trait;
use serde_json::Value;

use super::error::StoreResult;
use super::types::{Attributes, Cursor, Item, PrimaryKey, ScanPage, WriteAck};

// =============================================================================
// Store Client (Infrastructure - key-value tables)
// =============================================================================

#[async_trait]
pub trait BaseStoreClient: Send + Sync {
    /// Read up to `limit` items starting after `cursor`.
    ///
    /// Scans must be cursor-stable: resuming from a returned cursor yields the
    /// same subsequent items an uninterrupted scan would have.
    async fn scan(&self, table: &str, cursor: Option<&Cursor>, limit: usize)
        -> StoreResult<ScanPage>;

    async fn get(&self, table: &str, key: &PrimaryKey) -> StoreResult<Option<Item>>;

    /// Point-read several keys. Missing keys are simply absent from the result.
    async fn batch_get(&self, table: &str, keys: &[PrimaryKey]) -> StoreResult<Vec<Item>> {
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(item) = self.get(table, key).await? {
                found.push(item);
            }
        }
        Ok(found)
    }

    /// Put up to [`MAX_BATCH_ITEMS`](super::types::MAX_BATCH_ITEMS) items.
    async fn batch_write(&self, table: &str, items: Vec<Item>) -> StoreResult<WriteAck>;

    async fn batch_delete(&self, table: &str, keys: Vec<PrimaryKey>) -> StoreResult<WriteAck>;

    /// All items sharing a partition key, ordered by sort key.
    async fn query(&self, table: &str, partition: &str) -> StoreResult<Vec<Item>>;

    /// Merge `changes` into an existing item. Fails with `NotFound` if absent.
    async fn update(
        &self,
        table: &str,
        key: &PrimaryKey,
        changes: Attributes,
    ) -> StoreResult<Item>;
}

// =============================================================================
// Blob Store (Infrastructure - read-only JSON payloads)
// =============================================================================

#[async_trait]
pub trait BaseBlobStore: Send + Sync {
    /// Fetch and parse a JSON payload. `Ok(None)` when the key does not exist.
    async fn get_json(&self, key: &str) -> StoreResult<Option<Value>>;
}
