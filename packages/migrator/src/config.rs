use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::kernel::RetryPolicy;

/// Migrator configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Destination single table
    pub dynamo_table: String,
    /// Prefix of the legacy per-entity tables (`{prefix}_USERS`, ...)
    pub dynamo_prefix: String,
    pub store_file: PathBuf,
    pub blob_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub concurrency: usize,
    pub maintain_card_hashes: bool,
    /// Single cube for `repair_cube_hashes`; ignored by every other job
    pub cube_id: Option<String>,
    pub store_max_attempts: u32,
    pub store_backoff_ms: u64,
    pub store_call_timeout_ms: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            dynamo_table: env::var("DYNAMO_TABLE").context("DYNAMO_TABLE must be set")?,
            dynamo_prefix: env::var("DYNAMO_PREFIX").unwrap_or_else(|_| "LOCAL".to_string()),
            store_file: env::var("MIGRATOR_STORE_FILE")
                .unwrap_or_else(|_| "data/store.json".to_string())
                .into(),
            blob_dir: env::var("MIGRATOR_BLOB_DIR")
                .unwrap_or_else(|_| "data/blobs".to_string())
                .into(),
            checkpoint_dir: env::var("CHECKPOINT_DIR")
                .unwrap_or_else(|_| "temp".to_string())
                .into(),
            concurrency: env::var("MIGRATION_CONCURRENCY")
                .unwrap_or_else(|_| "25".to_string())
                .parse()
                .context("MIGRATION_CONCURRENCY must be a valid number")?,
            maintain_card_hashes: env::var("MAINTAIN_CUBE_CARD_HASHES")
                .map(|v| v == "true")
                .unwrap_or(false),
            cube_id: env::var("CUBE_ID").ok().filter(|id| !id.is_empty()),
            store_max_attempts: env::var("STORE_MAX_ATTEMPTS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .context("STORE_MAX_ATTEMPTS must be a valid number")?,
            store_backoff_ms: env::var("STORE_BACKOFF_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .context("STORE_BACKOFF_MS must be a valid number")?,
            store_call_timeout_ms: env::var("STORE_CALL_TIMEOUT_MS")
                .unwrap_or_else(|_| "10000".to_string())
                .parse()
                .context("STORE_CALL_TIMEOUT_MS must be a valid number")?,
        })
    }

    /// Retry policy applied to every store call
    pub fn retry_policy(&self) -> RetryPolicy {
        let base = Duration::from_millis(self.store_backoff_ms);
        RetryPolicy {
            max_attempts: self.store_max_attempts.max(1),
            base_backoff: base,
            max_backoff: base.saturating_mul(16),
            call_timeout: (self.store_call_timeout_ms > 0)
                .then(|| Duration::from_millis(self.store_call_timeout_ms)),
        }
    }

    /// Table name of a legacy entity table, e.g. `LOCAL_USERS`
    pub fn legacy_table(&self, suffix: &str) -> String {
        format!("{}_{}", self.dynamo_prefix, suffix)
    }
}
