//! In-process store backed by ordered maps.
//!
//! Tables are kept sorted by `(PK, SK)` so scans have the stable, monotonic
//! cursor semantics the runner depends on for resumption.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::error::{StoreError, StoreResult};
use super::traits::BaseStoreClient;
use super::types::{Attributes, Cursor, Item, PrimaryKey, ScanPage, WriteAck, MAX_BATCH_ITEMS};

type Table = BTreeMap<PrimaryKey, Attributes>;

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<HashMap<String, Table>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite one item.
    pub async fn put(&self, table: &str, item: Item) {
        let mut tables = self.tables.write().await;
        tables
            .entry(table.to_string())
            .or_default()
            .insert(item.key, item.attributes);
    }

    /// Insert items from flat JSON objects (see [`Item::from_json`]).
    pub async fn seed(&self, table: &str, rows: Vec<Value>) -> StoreResult<()> {
        let items = rows
            .into_iter()
            .map(Item::from_json)
            .collect::<StoreResult<Vec<_>>>()?;
        let mut tables = self.tables.write().await;
        let entries = tables.entry(table.to_string()).or_default();
        for item in items {
            entries.insert(item.key, item.attributes);
        }
        Ok(())
    }

    pub async fn len(&self, table: &str) -> usize {
        self.tables.read().await.get(table).map_or(0, |t| t.len())
    }

    pub async fn contains(&self, table: &str, key: &PrimaryKey) -> bool {
        self.tables
            .read()
            .await
            .get(table)
            .is_some_and(|t| t.contains_key(key))
    }

    /// Every item of a table in key order.
    pub async fn items(&self, table: &str) -> Vec<Item> {
        self.tables
            .read()
            .await
            .get(table)
            .map(|t| {
                t.iter()
                    .map(|(k, a)| Item::new(k.clone(), a.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All tables as flat JSON rows, keyed by table name.
    pub async fn dump(&self) -> BTreeMap<String, Vec<Value>> {
        let tables = self.tables.read().await;
        tables
            .iter()
            .map(|(name, table)| {
                let rows = table
                    .iter()
                    .map(|(k, a)| Item::new(k.clone(), a.clone()).to_json())
                    .collect();
                (name.clone(), rows)
            })
            .collect()
    }

    fn check_batch(size: usize) -> StoreResult<()> {
        if size > MAX_BATCH_ITEMS {
            return Err(StoreError::BatchTooLarge {
                size,
                limit: MAX_BATCH_ITEMS,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BaseStoreClient for MemoryStore {
    async fn scan(
        &self,
        table: &str,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> StoreResult<ScanPage> {
        let start = match cursor {
            Some(c) => {
                let key = c
                    .last_key()
                    .ok_or_else(|| StoreError::Backend(format!("malformed cursor: {}", c.0)))?;
                Bound::Excluded(key)
            }
            None => Bound::Unbounded,
        };

        let tables = self.tables.read().await;
        let Some(entries) = tables.get(table) else {
            return Ok(ScanPage::default());
        };

        let mut range = entries.range((start, Bound::Unbounded));
        let items: Vec<Item> = range
            .by_ref()
            .take(limit.max(1))
            .map(|(k, a)| Item::new(k.clone(), a.clone()))
            .collect();
        let more = range.next().is_some();

        let next_cursor = match items.last() {
            Some(last) if more => Some(Cursor::after(&last.key)),
            _ => None,
        };

        Ok(ScanPage { items, next_cursor })
    }

    async fn get(&self, table: &str, key: &PrimaryKey) -> StoreResult<Option<Item>> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .and_then(|t| t.get(key))
            .map(|a| Item::new(key.clone(), a.clone())))
    }

    async fn batch_get(&self, table: &str, keys: &[PrimaryKey]) -> StoreResult<Vec<Item>> {
        let tables = self.tables.read().await;
        let Some(entries) = tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(keys
            .iter()
            .filter_map(|k| entries.get(k).map(|a| Item::new(k.clone(), a.clone())))
            .collect())
    }

    async fn batch_write(&self, table: &str, items: Vec<Item>) -> StoreResult<WriteAck> {
        Self::check_batch(items.len())?;
        let mut tables = self.tables.write().await;
        let entries = tables.entry(table.to_string()).or_default();
        for item in items {
            entries.insert(item.key, item.attributes);
        }
        Ok(WriteAck::complete())
    }

    async fn batch_delete(&self, table: &str, keys: Vec<PrimaryKey>) -> StoreResult<WriteAck> {
        Self::check_batch(keys.len())?;
        let mut tables = self.tables.write().await;
        if let Some(entries) = tables.get_mut(table) {
            for key in &keys {
                entries.remove(key);
            }
        }
        Ok(WriteAck::complete())
    }

    async fn query(&self, table: &str, partition: &str) -> StoreResult<Vec<Item>> {
        let tables = self.tables.read().await;
        let Some(entries) = tables.get(table) else {
            return Ok(Vec::new());
        };
        let start = PrimaryKey::partition(partition);
        Ok(entries
            .range(start..)
            .take_while(|(k, _)| k.pk == partition)
            .map(|(k, a)| Item::new(k.clone(), a.clone()))
            .collect())
    }

    async fn update(
        &self,
        table: &str,
        key: &PrimaryKey,
        changes: Attributes,
    ) -> StoreResult<Item> {
        let mut tables = self.tables.write().await;
        let attributes = tables
            .get_mut(table)
            .and_then(|t| t.get_mut(key))
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_string(),
                key: key.clone(),
            })?;
        for (name, value) in changes {
            attributes.insert(name, value);
        }
        Ok(Item::new(key.clone(), attributes.clone()))
    }
}
