use std::time::Duration;
use thiserror::Error;

use super::types::PrimaryKey;

/// Errors surfaced by a store or blob client.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request throttled: {0}")]
    Throttled(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("item {key} not found in {table}")]
    NotFound { table: String, key: PrimaryKey },

    #[error("batch of {size} items exceeds the limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Throttled(_) | Self::Timeout(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
