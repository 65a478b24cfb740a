use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Counters for one named migration. Only ever incremented during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStats {
    /// Source records observed
    pub total: u64,
    /// Destination writes performed (`updated` for repair jobs)
    #[serde(alias = "updated")]
    pub migrated: u64,
    /// Already present, or invalid source data
    pub skipped: u64,
    /// Failed transforms, reads or writes
    pub errors: u64,
    /// Job-specific counters
    #[serde(flatten)]
    pub extra: BTreeMap<String, u64>,
}

impl MigrationStats {
    pub fn bump(&mut self, counter: &str, by: u64) {
        if by > 0 {
            *self.extra.entry(counter.to_string()).or_default() += by;
        }
    }

    pub fn extra(&self, counter: &str) -> u64 {
        self.extra.get(counter).copied().unwrap_or(0)
    }

    /// Add another page's counters to these.
    pub fn merge(&mut self, other: &MigrationStats) {
        self.total += other.total;
        self.migrated += other.migrated;
        self.skipped += other.skipped;
        self.errors += other.errors;
        for (name, value) in &other.extra {
            self.bump(name, *value);
        }
    }
}
