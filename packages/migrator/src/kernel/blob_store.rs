//! Read-only JSON blob stores (card lists, seats, cube card data).

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use super::error::{StoreError, StoreResult};
use super::traits::BaseBlobStore;

/// Blobs laid out as files under a root directory, `key` being the relative path.
pub struct DirBlobStore {
    root: PathBuf,
}

impl DirBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BaseBlobStore for DirBlobStore {
    async fn get_json(&self, key: &str) -> StoreResult<Option<Value>> {
        if key.split('/').any(|part| part == "..") {
            return Err(StoreError::Backend(format!("invalid blob key: {}", key)));
        }
        match tokio::fs::read(self.root.join(key)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Blob store held in memory, used by tests and single-entity dry runs.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<HashMap<String, Value>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob(self, key: &str, value: Value) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&self, key: &str, value: Value) {
        if let Ok(mut blobs) = self.blobs.lock() {
            blobs.insert(key.to_string(), value);
        }
    }
}

#[async_trait]
impl BaseBlobStore for MemoryBlobStore {
    async fn get_json(&self, key: &str) -> StoreResult<Option<Value>> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| StoreError::Backend("blob store lock poisoned".into()))?;
        Ok(blobs.get(key).cloned())
    }
}
