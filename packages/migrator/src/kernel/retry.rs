//! The one retry policy every store call goes through.
//!
//! Only transient failures (throttling, timeouts) are retried, with
//! exponential backoff. Anything else is returned to the caller at once, where
//! it becomes a per-record or per-batch error in the run statistics.

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::error::{StoreError, StoreResult};
use super::traits::{BaseBlobStore, BaseStoreClient};
use super::types::{Attributes, Cursor, Item, PrimaryKey, ScanPage, WriteAck};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Per-attempt deadline. `None` waits indefinitely.
    pub call_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            call_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no timeout.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            call_timeout: None,
        }
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = StoreResult<T>> + Send,
        T: Send,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = match self.call_timeout {
                Some(limit) => match tokio::time::timeout(limit, call()).await {
                    Ok(result) => result,
                    Err(_) => Err(StoreError::Timeout(limit)),
                },
                None => call().await,
            };

            match result {
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient store failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Wraps a store so each call is governed by a [`RetryPolicy`].
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<S: BaseStoreClient> BaseStoreClient for RetryingStore<S> {
    async fn scan(
        &self,
        table: &str,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> StoreResult<ScanPage> {
        self.policy
            .run("scan", || self.inner.scan(table, cursor, limit))
            .await
    }

    async fn get(&self, table: &str, key: &PrimaryKey) -> StoreResult<Option<Item>> {
        self.policy.run("get", || self.inner.get(table, key)).await
    }

    async fn batch_get(&self, table: &str, keys: &[PrimaryKey]) -> StoreResult<Vec<Item>> {
        self.policy
            .run("batch_get", || self.inner.batch_get(table, keys))
            .await
    }

    async fn batch_write(&self, table: &str, items: Vec<Item>) -> StoreResult<WriteAck> {
        self.policy
            .run("batch_write", || self.inner.batch_write(table, items.clone()))
            .await
    }

    async fn batch_delete(&self, table: &str, keys: Vec<PrimaryKey>) -> StoreResult<WriteAck> {
        self.policy
            .run("batch_delete", || self.inner.batch_delete(table, keys.clone()))
            .await
    }

    async fn query(&self, table: &str, partition: &str) -> StoreResult<Vec<Item>> {
        self.policy
            .run("query", || self.inner.query(table, partition))
            .await
    }

    async fn update(
        &self,
        table: &str,
        key: &PrimaryKey,
        changes: Attributes,
    ) -> StoreResult<Item> {
        self.policy
            .run("update", || self.inner.update(table, key, changes.clone()))
            .await
    }
}

#[async_trait]
impl<S: BaseBlobStore> BaseBlobStore for RetryingStore<S> {
    async fn get_json(&self, key: &str) -> StoreResult<Option<Value>> {
        self.policy.run("get_json", || self.inner.get_json(key)).await
    }
}
