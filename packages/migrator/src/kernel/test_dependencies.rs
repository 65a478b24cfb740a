// TestDependencies - mock implementations for testing
//
// MockStoreClient wraps a MemoryStore, records every call that matters to the
// runner (scan cursors, writes, deletes) and injects store failures on demand.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use super::error::{StoreError, StoreResult};
use super::memory_store::MemoryStore;
use super::traits::BaseStoreClient;
use super::types::{Attributes, Cursor, Item, PrimaryKey, ScanPage, WriteAck};

/// Arguments captured from a scan call
#[derive(Debug, Clone, PartialEq)]
pub struct ScanCall {
    pub table: String,
    pub cursor: Option<Cursor>,
    pub limit: usize,
}

/// One mutation, in the order the store saw it
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Write(PrimaryKey),
    Delete(PrimaryKey),
    Update(PrimaryKey),
}

#[derive(Clone, Default)]
pub struct MockStoreClient {
    store: MemoryStore,
    scan_calls: Arc<Mutex<Vec<ScanCall>>>,
    get_calls: Arc<Mutex<Vec<PrimaryKey>>>,
    written: Arc<Mutex<Vec<PrimaryKey>>>,
    deleted: Arc<Mutex<Vec<PrimaryKey>>>,
    updated: Arc<Mutex<Vec<PrimaryKey>>>,
    batch_sizes: Arc<Mutex<Vec<usize>>>,
    mutations: Arc<Mutex<Vec<Mutation>>>,
    failing_gets: Arc<Mutex<HashSet<String>>>,
    unprocessed: Arc<Mutex<HashSet<String>>>,
    failing_batch_writes: Arc<Mutex<u32>>,
    failing_scans: Arc<Mutex<u32>>,
}

impl MockStoreClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an already-populated store.
    pub fn from_store(store: MemoryStore) -> Self {
        Self {
            store,
            ..Self::default()
        }
    }

    /// Point reads of any key with this partition key fail.
    pub fn with_failing_get(self, pk: &str) -> Self {
        self.failing_gets.lock().unwrap().insert(pk.to_string());
        self
    }

    /// Writes of this partition key are acknowledged as unprocessed.
    pub fn with_unprocessed(self, pk: &str) -> Self {
        self.unprocessed.lock().unwrap().insert(pk.to_string());
        self
    }

    /// The next `n` batch writes fail as a whole with a throttling error.
    pub fn with_failing_batch_writes(self, n: u32) -> Self {
        *self.failing_batch_writes.lock().unwrap() = n;
        self
    }

    /// The next `n` scans fail.
    pub fn with_failing_scans(self, n: u32) -> Self {
        *self.failing_scans.lock().unwrap() = n;
        self
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn scan_calls(&self) -> Vec<ScanCall> {
        self.scan_calls.lock().unwrap().clone()
    }

    pub fn get_calls(&self) -> Vec<PrimaryKey> {
        self.get_calls.lock().unwrap().clone()
    }

    /// Keys applied by batch writes, in write order.
    pub fn written_keys(&self) -> Vec<PrimaryKey> {
        self.written.lock().unwrap().clone()
    }

    pub fn deleted_keys(&self) -> Vec<PrimaryKey> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn updated_keys(&self) -> Vec<PrimaryKey> {
        self.updated.lock().unwrap().clone()
    }

    /// Sizes of every batch write and delete call.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }

    /// Every applied write, delete and update, interleaved in call order.
    pub fn mutations(&self) -> Vec<Mutation> {
        self.mutations.lock().unwrap().clone()
    }

    /// Clear injected get failures and unprocessed keys.
    pub fn heal(&self) {
        self.unprocessed.lock().unwrap().clear();
        self.failing_gets.lock().unwrap().clear();
    }

    pub fn reset_calls(&self) {
        self.scan_calls.lock().unwrap().clear();
        self.get_calls.lock().unwrap().clear();
        self.written.lock().unwrap().clear();
        self.deleted.lock().unwrap().clear();
        self.updated.lock().unwrap().clear();
        self.batch_sizes.lock().unwrap().clear();
        self.mutations.lock().unwrap().clear();
    }

    fn take_failure(counter: &Mutex<u32>) -> bool {
        let mut remaining = counter.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl BaseStoreClient for MockStoreClient {
    async fn scan(
        &self,
        table: &str,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> StoreResult<ScanPage> {
        self.scan_calls.lock().unwrap().push(ScanCall {
            table: table.to_string(),
            cursor: cursor.cloned(),
            limit,
        });
        if Self::take_failure(&self.failing_scans) {
            return Err(StoreError::Backend("injected scan failure".into()));
        }
        self.store.scan(table, cursor, limit).await
    }

    async fn get(&self, table: &str, key: &PrimaryKey) -> StoreResult<Option<Item>> {
        self.get_calls.lock().unwrap().push(key.clone());
        if self.failing_gets.lock().unwrap().contains(&key.pk) {
            return Err(StoreError::Throttled(format!("injected get failure for {}", key)));
        }
        self.store.get(table, key).await
    }

    async fn batch_write(&self, table: &str, items: Vec<Item>) -> StoreResult<WriteAck> {
        self.batch_sizes.lock().unwrap().push(items.len());
        if Self::take_failure(&self.failing_batch_writes) {
            return Err(StoreError::Throttled("injected batch write failure".into()));
        }

        let rejected = self.unprocessed.lock().unwrap().clone();
        let (skipped, accepted): (Vec<Item>, Vec<Item>) =
            items.into_iter().partition(|i| rejected.contains(&i.key.pk));

        self.written
            .lock()
            .unwrap()
            .extend(accepted.iter().map(|i| i.key.clone()));
        self.mutations
            .lock()
            .unwrap()
            .extend(accepted.iter().map(|i| Mutation::Write(i.key.clone())));
        let mut ack = self.store.batch_write(table, accepted).await?;
        ack.unprocessed.extend(skipped.into_iter().map(|i| i.key));
        Ok(ack)
    }

    async fn batch_delete(&self, table: &str, keys: Vec<PrimaryKey>) -> StoreResult<WriteAck> {
        self.batch_sizes.lock().unwrap().push(keys.len());
        self.deleted.lock().unwrap().extend(keys.iter().cloned());
        self.mutations
            .lock()
            .unwrap()
            .extend(keys.iter().cloned().map(Mutation::Delete));
        self.store.batch_delete(table, keys).await
    }

    async fn query(&self, table: &str, partition: &str) -> StoreResult<Vec<Item>> {
        self.store.query(table, partition).await
    }

    async fn update(
        &self,
        table: &str,
        key: &PrimaryKey,
        changes: Attributes,
    ) -> StoreResult<Item> {
        self.updated.lock().unwrap().push(key.clone());
        self.mutations.lock().unwrap().push(Mutation::Update(key.clone()));
        self.store.update(table, key, changes).await
    }
}
