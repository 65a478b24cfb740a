//! Keeps re-runs additive: candidates whose destination key already exists
//! are dropped instead of overwritten.

use futures::future::join_all;
use std::collections::HashSet;
use tracing::{debug, warn};

use super::record::DestinationRecord;
use crate::kernel::{BaseStoreClient, PrimaryKey};

/// What to assume when the existence check for a candidate fails.
///
/// Each job picks one explicitly; there is no engine-wide default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistencePolicy {
    /// Write anyway. Risks a redundant overwrite, never loses a record.
    AssumeAbsent,
    /// Skip. Never overwrites, but the record waits for the next run.
    AssumePresent,
}

impl ExistencePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AssumeAbsent => "assume_absent",
            Self::AssumePresent => "assume_present",
        }
    }
}

#[derive(Debug, Default)]
pub struct FilterOutcome {
    pub to_write: Vec<DestinationRecord>,
    /// Already present, duplicated within the page, or skipped by policy
    pub skipped: u64,
    /// Checks that errored and were resolved by the policy
    pub check_failures: u64,
}

pub struct ExistenceFilter<'a> {
    store: &'a dyn BaseStoreClient,
    table: &'a str,
    policy: ExistencePolicy,
    concurrency: usize,
}

impl<'a> ExistenceFilter<'a> {
    pub fn new(
        store: &'a dyn BaseStoreClient,
        table: &'a str,
        policy: ExistencePolicy,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            table,
            policy,
            concurrency: concurrency.max(1),
        }
    }

    /// Point-read every candidate's key, `concurrency` reads at a time.
    pub async fn filter<F>(&self, candidates: Vec<DestinationRecord>, key_of: F) -> FilterOutcome
    where
        F: Fn(&DestinationRecord) -> PrimaryKey,
    {
        let mut outcome = FilterOutcome::default();

        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(candidates.len());
        for record in candidates {
            let key = key_of(&record);
            if seen.insert(key.clone()) {
                unique.push((key, record));
            } else {
                debug!(key = %key, "Duplicate candidate in page, skipping");
                outcome.skipped += 1;
            }
        }

        for chunk in unique.chunks(self.concurrency) {
            let checks = chunk
                .iter()
                .map(|(key, _)| self.store.get(self.table, key));
            let results = join_all(checks).await;

            for ((key, record), result) in chunk.iter().zip(results) {
                match result {
                    Ok(Some(_)) => {
                        debug!(key = %key, "Already migrated, skipping");
                        outcome.skipped += 1;
                    }
                    Ok(None) => outcome.to_write.push(record.clone()),
                    Err(e) => {
                        outcome.check_failures += 1;
                        warn!(
                            key = %key,
                            policy = self.policy.as_str(),
                            error = %e,
                            "Existence check failed"
                        );
                        match self.policy {
                            ExistencePolicy::AssumeAbsent => outcome.to_write.push(record.clone()),
                            ExistencePolicy::AssumePresent => outcome.skipped += 1,
                        }
                    }
                }
            }
        }

        outcome
    }
}
