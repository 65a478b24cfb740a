//! Data migration framework for checkpointed, batch-oriented store migrations
//!
//! This module provides one engine for every migration and index-repair job:
//! resumable page scans, existence-checked additive writes, index
//! reconciliation, error budgets and progress reporting.
//!
//! # Job kinds
//!
//! - Copy jobs implement [`DataMigration`]: each legacy record is transformed
//!   into zero or more single-table records, which are written only if their
//!   destination key does not exist yet.
//! - Repair jobs implement [`IndexRepair`]: each scanned entity's derived
//!   index rows are reconciled against the rows currently stored.
//!
//! # Usage
//!
//! 1. Implement `DataMigration` or `IndexRepair` for your job
//! 2. Register it in [`all_migrations`]
//! 3. Run via `migrate_cli run <name>`
//!
//! # Example
//!
//! ```rust,ignore
//! pub struct MigrateTagsMigration;
//!
//! #[async_trait]
//! impl DataMigration for MigrateTagsMigration {
//!     fn name(&self) -> &'static str { "migrate_tags" }
//!
//!     fn source_table(&self, ctx: &MigrationContext) -> String {
//!         ctx.legacy_table("TAGS")
//!     }
//!
//!     fn existence_policy(&self) -> ExistencePolicy {
//!         ExistencePolicy::AssumeAbsent
//!     }
//!
//!     async fn transform(&self, source: &SourceRecord, _ctx: &MigrationContext) -> Result<Transformed> {
//!         let id = match source.require("id") {
//!             Ok(id) => id,
//!             Err(reason) => return Ok(reason.into()),
//!         };
//!         // Build the single-table record
//!     }
//! }
//! ```

pub mod checkpoint;
pub mod existence;
pub mod migrate_changelog;
pub mod migrate_drafts;
pub mod migrate_users;
pub mod progress;
pub mod reconciler;
pub mod record;
pub mod repair_cube_hashes;
pub mod runner;
pub mod stats;
mod workflow;

pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
};
pub use existence::{ExistenceFilter, ExistencePolicy, FilterOutcome};
pub use progress::{
    CollectingSink, LineSink, OutputFormat, ProgressEvent, ProgressHandle, ProgressReporter,
    ProgressSink,
};
pub use reconciler::{
    diff_index_rows, ApplyMode, IndexDiff, IndexReconciler, IndexRow, IndexedEntity,
    OwnerLookup, ReconcileError, ReconcileOutcome, ReconcileReport,
};
pub use record::{DestinationRecord, GsiKey, SkipReason, SourceRecord, Transformed};
pub use runner::{
    BatchRunner, EntityReport, MigrationError, RunOptions, RunOutcome, RunSummary, StartMode,
};
pub use stats::MigrationStats;
pub use workflow::{RunContext, RunPhase};

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::kernel::{BaseBlobStore, BaseStoreClient, Item, PrimaryKey};

/// Result of running one entity through a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationResult {
    /// Entity was written (or its index repaired)
    Migrated,
    /// Entity was skipped (already migrated, unchanged or not applicable)
    Skipped,
    /// Dry-run: entity would have been written
    WouldMigrate,
    /// Dry-run: entity would have been skipped
    WouldSkip,
}

impl MigrationResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Migrated => "migrated",
            Self::Skipped => "skipped",
            Self::WouldMigrate => "would_migrate",
            Self::WouldSkip => "would_skip",
        }
    }
}

/// Context passed to every job
#[derive(Clone)]
pub struct MigrationContext {
    pub store: Arc<dyn BaseStoreClient>,
    pub blobs: Arc<dyn BaseBlobStore>,
    /// Single table all jobs write to
    pub destination_table: String,
    /// Prefix of the legacy per-entity tables
    pub legacy_prefix: String,
    /// Whether this is a dry-run (no mutations, no checkpoints)
    pub dry_run: bool,
    /// Bound on in-flight store calls within a page
    pub concurrency: usize,
    /// Include card-derived hashes when deriving cube index rows
    pub maintain_card_hashes: bool,
}

impl MigrationContext {
    pub fn new(
        store: Arc<dyn BaseStoreClient>,
        blobs: Arc<dyn BaseBlobStore>,
        destination_table: impl Into<String>,
    ) -> Self {
        Self {
            store,
            blobs,
            destination_table: destination_table.into(),
            legacy_prefix: "LOCAL".to_string(),
            dry_run: false,
            concurrency: 25,
            maintain_card_hashes: false,
        }
    }

    pub fn with_legacy_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.legacy_prefix = prefix.into();
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_card_hashes(mut self, maintain: bool) -> Self {
        self.maintain_card_hashes = maintain;
        self
    }

    /// Legacy table name, e.g. `LOCAL_DRAFT`
    pub fn legacy_table(&self, suffix: &str) -> String {
        format!("{}_{}", self.legacy_prefix, suffix)
    }
}

/// A copy job: legacy records in, single-table records out.
///
/// Each migration must be:
/// - Additive: existing destination records are never overwritten
/// - Pure in its transform: the output depends only on the source record
///   and the blobs it references
#[async_trait]
pub trait DataMigration: Send + Sync + 'static {
    /// Unique name for this migration (also names its checkpoint file)
    fn name(&self) -> &'static str;

    /// Optional description shown in migration list
    fn description(&self) -> &'static str {
        ""
    }

    /// Table scanned for source records
    fn source_table(&self, ctx: &MigrationContext) -> String;

    /// Records per scanned page (default: 200)
    fn page_size(&self) -> usize {
        200
    }

    /// Errors tolerated before the run aborts (default: 100)
    fn error_budget(&self) -> u64 {
        100
    }

    /// What a failed existence check means for this job
    fn existence_policy(&self) -> ExistencePolicy;

    /// Key probed to decide whether a record was already migrated
    fn existence_key_of(&self, record: &DestinationRecord) -> PrimaryKey {
        record.key.clone()
    }

    async fn transform(&self, source: &SourceRecord, ctx: &MigrationContext)
        -> Result<Transformed>;
}

/// An index-repair job: reconcile each scanned entity's derived index rows.
pub trait IndexRepair: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str {
        ""
    }

    /// Entity noun used by `--test-<entity>` (e.g. "cube")
    fn entity_label(&self) -> &'static str;

    /// Table scanned for entities
    fn source_table(&self, ctx: &MigrationContext) -> String;

    /// Entities per scanned page (default: 100)
    fn page_size(&self) -> usize {
        100
    }

    fn error_budget(&self) -> u64 {
        100
    }

    /// Entity id of a scanned item, or `None` if the item is not an entity
    /// this job repairs.
    fn entity_id_of(&self, item: &Item) -> Option<String>;

    fn indexed_entity(&self) -> &dyn IndexedEntity;

    /// Where missing owners are looked up, if anywhere
    fn owner_lookup(&self) -> Option<&dyn OwnerLookup> {
        None
    }
}

pub enum JobKind {
    Migrate(Box<dyn DataMigration>),
    Repair(Box<dyn IndexRepair>),
}

/// Registry entry for a migration
pub struct MigrationEntry {
    pub job: JobKind,
}

impl MigrationEntry {
    pub fn migration<M: DataMigration>(m: M) -> Self {
        Self {
            job: JobKind::Migrate(Box::new(m)),
        }
    }

    pub fn repair<R: IndexRepair>(r: R) -> Self {
        Self {
            job: JobKind::Repair(Box::new(r)),
        }
    }

    pub fn name(&self) -> &'static str {
        match &self.job {
            JobKind::Migrate(m) => m.name(),
            JobKind::Repair(r) => r.name(),
        }
    }

    pub fn description(&self) -> &'static str {
        match &self.job {
            JobKind::Migrate(m) => m.description(),
            JobKind::Repair(r) => r.description(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match &self.job {
            JobKind::Migrate(_) => "migrate",
            JobKind::Repair(_) => "repair",
        }
    }

    pub fn source_table(&self, ctx: &MigrationContext) -> String {
        match &self.job {
            JobKind::Migrate(m) => m.source_table(ctx),
            JobKind::Repair(r) => r.source_table(ctx),
        }
    }

    pub fn page_size(&self) -> usize {
        match &self.job {
            JobKind::Migrate(m) => m.page_size(),
            JobKind::Repair(r) => r.page_size(),
        }
    }

    pub fn error_budget(&self) -> u64 {
        match &self.job {
            JobKind::Migrate(m) => m.error_budget(),
            JobKind::Repair(r) => r.error_budget(),
        }
    }
}

/// Get all registered migrations
///
/// Add new migrations to this function.
pub fn all_migrations() -> Vec<MigrationEntry> {
    vec![
        // Register migrations here:
        MigrationEntry::migration(migrate_users::MigrateUsersMigration),
        MigrationEntry::migration(migrate_drafts::MigrateDraftsMigration),
        MigrationEntry::migration(migrate_changelog::MigrateChangelogMigration),
        MigrationEntry::repair(repair_cube_hashes::RepairCubeHashes::new()),
    ]
}

/// Find a migration by name
pub fn find_migration(name: &str) -> Option<MigrationEntry> {
    all_migrations().into_iter().find(|e| e.name() == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_migration_names_are_unique() {
        let names: Vec<_> = all_migrations().iter().map(|e| e.name()).collect();
        let unique: HashSet<_> = names.iter().collect();
        assert_eq!(names.len(), unique.len());
    }

    #[test]
    fn test_find_migration() {
        assert!(find_migration("repair_cube_hashes").is_some());
        assert!(find_migration("does_not_exist").is_none());
    }
}
