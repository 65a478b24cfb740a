//! The batch runner: drives the page loop for any registered job.
//!
//! Idle -> Scanning -> Transforming -> Filtering -> Writing -> Checkpointing,
//! looping back to Scanning until the scan is exhausted (Done) or the error
//! budget is exceeded (Draining). Pages are strictly sequential; work within
//! a page runs `concurrency` store calls at a time.

use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::checkpoint::{CheckpointError, CheckpointStore};
use super::existence::ExistenceFilter;
use super::progress::{ProgressEvent, ProgressHandle};
use super::reconciler::{ApplyMode, IndexReconciler, ReconcileError, ReconcileOutcome};
use super::record::{DestinationRecord, SourceRecord, Transformed};
use super::stats::MigrationStats;
use super::workflow::{RunContext, RunPhase};
use super::{
    DataMigration, IndexRepair, JobKind, MigrationContext, MigrationEntry, MigrationResult,
};
use crate::kernel::{Item, PrimaryKey, StoreError, MAX_BATCH_ITEMS};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartMode {
    /// Continue from the saved checkpoint if there is one
    #[default]
    Resume,
    /// Discard any saved checkpoint and start from the beginning
    Reset,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub start: StartMode,
    /// Overrides the job's page size
    pub page_size: Option<usize>,
    /// Overrides the job's error budget
    pub error_budget: Option<u64>,
    /// Stop cleanly (checkpoint kept) after this many pages
    pub max_pages: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Source exhausted within budget; checkpoint cleared
    Completed,
    /// Error budget exceeded; checkpoint kept
    Aborted { errors: u64, budget: u64 },
    /// Page limit reached; checkpoint kept
    Stopped { pages: u64 },
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "complete",
            Self::Aborted { .. } => "aborted",
            Self::Stopped { .. } => "stopped",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed => 0,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub job: String,
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub stats: MigrationStats,
    pub batches: u64,
    pub elapsed: Duration,
    pub dry_run: bool,
    /// Location of the checkpoint left behind, if any
    pub checkpoint: Option<String>,
}

/// Step-by-step account of one entity run through a job.
#[derive(Debug, Clone)]
pub struct EntityReport {
    pub job: String,
    pub entity_id: String,
    pub result: MigrationResult,
    pub steps: Vec<String>,
    pub reconcile: Option<ReconcileOutcome>,
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Migration '{0}' not found")]
    UnknownJob(String),

    #[error("transform of {id} failed: {source}")]
    Transform {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{count} records of {id} were not written")]
    WriteFailed { id: String, count: u64 },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct BatchRunner {
    ctx: MigrationContext,
    checkpoints: Arc<dyn CheckpointStore>,
    progress: ProgressHandle,
}

impl BatchRunner {
    pub fn new(
        ctx: MigrationContext,
        checkpoints: Arc<dyn CheckpointStore>,
        progress: ProgressHandle,
    ) -> Self {
        Self {
            ctx,
            checkpoints,
            progress,
        }
    }

    pub fn context(&self) -> &MigrationContext {
        &self.ctx
    }

    fn apply_mode(&self) -> ApplyMode {
        if self.ctx.dry_run {
            ApplyMode::DryRun
        } else {
            ApplyMode::Apply
        }
    }

    fn warn(&self, job: &str, message: String) {
        self.progress.emit(ProgressEvent::Warning {
            job: job.to_string(),
            message,
        });
    }

    /// Run a job until its source is exhausted, its error budget is exceeded,
    /// or `max_pages` pages have been processed.
    pub async fn run(
        &self,
        entry: &MigrationEntry,
        opts: &RunOptions,
    ) -> Result<RunSummary, MigrationError> {
        let job = entry.name();
        let started = Instant::now();
        let dry_run = self.ctx.dry_run;

        let mut run = self.start(job, opts.start).await?;
        let table = entry.source_table(&self.ctx);
        let page_size = opts.page_size.unwrap_or_else(|| entry.page_size()).max(1);
        let budget = opts.error_budget.unwrap_or_else(|| entry.error_budget());

        info!(
            job,
            run_id = %run.run_id,
            table = %table,
            page_size,
            budget,
            dry_run,
            resumed = run.resumed,
            "Starting migration run"
        );
        self.progress.emit(ProgressEvent::RunStarted {
            job: job.to_string(),
            run_id: run.run_id,
            resumed: run.resumed,
            batch_number: run.batch_number,
            dry_run,
        });

        let mut pages = 0u64;
        let outcome = loop {
            run.enter(RunPhase::Scanning);
            if !run.pending_retry.is_empty() {
                self.retry_pending(&mut run).await;
            }

            let page = match self
                .ctx
                .store
                .scan(&table, run.cursor.as_ref(), page_size)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    run.stats.errors += 1;
                    warn!(job, batch = run.batch_number + 1, error = %e, "Scan failed");
                    self.warn(
                        job,
                        format!("scan for batch {} failed: {}", run.batch_number + 1, e),
                    );
                    if run.error_budget_exceeded(budget) {
                        break Self::drain(&mut run, budget);
                    }
                    // Same cursor again on the next iteration
                    continue;
                }
            };

            let page_records = page.items.len();
            let page_stats = match &entry.job {
                JobKind::Migrate(m) => self.copy_page(m.as_ref(), &mut run, page.items).await,
                JobKind::Repair(r) => self.repair_page(r.as_ref(), &mut run, page.items).await,
            };
            run.stats.merge(&page_stats);
            run.batch_number += 1;
            pages += 1;

            // The last page is not checkpointed: the run either completes and
            // clears the checkpoint, or aborts and leaves the previous one so
            // a resume re-processes this page.
            let exhausted = page.next_cursor.is_none();
            if !exhausted {
                run.cursor = page.next_cursor;
                self.save_checkpoint(&mut run).await;
            }

            self.progress.emit(ProgressEvent::BatchCompleted {
                job: job.to_string(),
                batch_number: run.batch_number,
                page_records,
                stats: run.stats.clone(),
            });

            if run.error_budget_exceeded(budget) {
                break Self::drain(&mut run, budget);
            }

            if exhausted {
                if !run.pending_retry.is_empty() {
                    self.retry_pending(&mut run).await;
                }
                run.enter(RunPhase::Done);
                if !dry_run {
                    match self.checkpoints.clear(job).await {
                        Ok(()) => run.has_checkpoint = false,
                        Err(e) => {
                            warn!(job, error = %e, "Failed to clear checkpoint");
                            self.warn(job, format!("checkpoint not cleared: {}", e));
                        }
                    }
                }
                break RunOutcome::Completed;
            }

            if opts.max_pages.is_some_and(|max| pages >= max) {
                info!(job, pages, "Page limit reached, stopping");
                if !run.pending_retry.is_empty() {
                    self.retry_pending(&mut run).await;
                    self.save_checkpoint(&mut run).await;
                }
                break RunOutcome::Stopped { pages };
            }
        };

        let elapsed = started.elapsed();
        let checkpoint = (!dry_run && run.has_checkpoint).then(|| self.checkpoints.location(job));

        match outcome {
            RunOutcome::Completed => info!(
                job,
                total = run.stats.total,
                migrated = run.stats.migrated,
                skipped = run.stats.skipped,
                errors = run.stats.errors,
                elapsed_ms = elapsed.as_millis() as u64,
                "Migration complete"
            ),
            RunOutcome::Aborted { errors, budget } => error!(
                job,
                errors,
                budget,
                checkpoint = ?checkpoint,
                "Error budget exceeded, migration aborted"
            ),
            RunOutcome::Stopped { pages } => info!(
                job,
                pages,
                checkpoint = ?checkpoint,
                "Migration stopped"
            ),
        }

        self.progress.emit(ProgressEvent::RunFinished {
            job: job.to_string(),
            outcome: outcome.as_str().to_string(),
            stats: run.stats.clone(),
            batches: run.batch_number,
            elapsed_ms: elapsed.as_millis() as u64,
            dry_run,
            checkpoint: checkpoint.clone(),
        });

        Ok(RunSummary {
            job: job.to_string(),
            run_id: run.run_id,
            outcome,
            stats: run.stats,
            batches: run.batch_number,
            elapsed,
            dry_run,
            checkpoint,
        })
    }

    async fn start(&self, job: &str, mode: StartMode) -> Result<RunContext, MigrationError> {
        match mode {
            StartMode::Reset => {
                if !self.ctx.dry_run {
                    self.checkpoints.clear(job).await?;
                    info!(job, "Checkpoint reset");
                }
                Ok(RunContext::fresh(job))
            }
            StartMode::Resume => match self.checkpoints.load(job).await {
                Ok(Some(checkpoint)) => {
                    info!(
                        job,
                        batch = checkpoint.batch_number,
                        total = checkpoint.stats.total,
                        "Resuming from checkpoint"
                    );
                    Ok(RunContext::from_checkpoint(job, checkpoint))
                }
                Ok(None) => Ok(RunContext::fresh(job)),
                Err(e) => {
                    warn!(job, error = %e, "Unreadable checkpoint, starting fresh");
                    self.warn(job, format!("ignoring unreadable checkpoint: {}", e));
                    Ok(RunContext::fresh(job))
                }
            },
        }
    }

    fn drain(run: &mut RunContext, budget: u64) -> RunOutcome {
        run.enter(RunPhase::Draining);
        RunOutcome::Aborted {
            errors: run.stats.errors,
            budget,
        }
    }

    /// Persist progress. A failure is reported and the run continues.
    async fn save_checkpoint(&self, run: &mut RunContext) {
        if self.ctx.dry_run {
            return;
        }
        run.enter(RunPhase::Checkpointing);
        match self.checkpoints.save(&run.job, &run.checkpoint()).await {
            Ok(()) => {
                run.has_checkpoint = true;
                debug!(job = %run.job, batch = run.batch_number, "Checkpoint saved");
                self.progress.emit(ProgressEvent::CheckpointSaved {
                    job: run.job.clone(),
                    batch_number: run.batch_number,
                    location: self.checkpoints.location(&run.job),
                });
            }
            Err(e) => {
                warn!(job = %run.job, batch = run.batch_number, error = %e, "Checkpoint save failed");
                self.progress.emit(ProgressEvent::CheckpointFailed {
                    job: run.job.clone(),
                    batch_number: run.batch_number,
                    message: e.to_string(),
                });
            }
        }
    }

    // =========================================================================
    // Copy jobs
    // =========================================================================

    async fn copy_page(
        &self,
        job: &dyn DataMigration,
        run: &mut RunContext,
        items: Vec<Item>,
    ) -> MigrationStats {
        let mut stats = MigrationStats {
            total: items.len() as u64,
            ..Default::default()
        };
        let concurrency = self.ctx.concurrency.max(1);
        let sources: Vec<SourceRecord> = items.into_iter().map(SourceRecord::new).collect();

        run.enter(RunPhase::Transforming);
        let mut candidates = Vec::new();
        for chunk in sources.chunks(concurrency) {
            let results = join_all(chunk.iter().map(|s| job.transform(s, &self.ctx))).await;
            for (source, result) in chunk.iter().zip(results) {
                match result {
                    Ok(Transformed::Records(records)) if records.is_empty() => stats.skipped += 1,
                    Ok(Transformed::Records(records)) => candidates.extend(records),
                    Ok(Transformed::Skip(reason)) => {
                        debug!(job = job.name(), key = %source.key(), reason = %reason, "Skipping invalid source record");
                        stats.skipped += 1;
                        stats.bump("invalidSource", 1);
                    }
                    Err(e) => {
                        warn!(job = job.name(), key = %source.key(), error = %e, "Transform failed");
                        stats.errors += 1;
                    }
                }
            }
        }

        run.enter(RunPhase::Filtering);
        let filter = ExistenceFilter::new(
            self.ctx.store.as_ref(),
            &self.ctx.destination_table,
            job.existence_policy(),
            concurrency,
        );
        let filtered = filter
            .filter(candidates, |record| job.existence_key_of(record))
            .await;
        stats.skipped += filtered.skipped;
        stats.bump("existenceCheckFailures", filtered.check_failures);

        run.enter(RunPhase::Writing);
        if self.ctx.dry_run {
            stats.bump("wouldMigrate", filtered.to_write.len() as u64);
            return stats;
        }
        let items: Vec<Item> = filtered.to_write.iter().map(DestinationRecord::to_item).collect();
        let failed = self.write_items(job.name(), items, &mut stats).await;
        run.pending_retry.extend(failed);
        stats
    }

    /// Write in store-sized batches. Returns the items of batches that
    /// failed as a whole; their errors are already counted.
    async fn write_items(
        &self,
        job: &str,
        items: Vec<Item>,
        stats: &mut MigrationStats,
    ) -> Vec<Item> {
        let table = self.ctx.destination_table.as_str();
        let mut failed = Vec::new();

        for chunk in items.chunks(MAX_BATCH_ITEMS) {
            match self.ctx.store.batch_write(table, chunk.to_vec()).await {
                Ok(ack) => {
                    let rejected = ack.unprocessed.len() as u64;
                    stats.migrated += (chunk.len() as u64).saturating_sub(rejected);
                    stats.errors += rejected;
                    for key in &ack.unprocessed {
                        warn!(job, key = %key, "Record not written");
                    }
                }
                Err(e) => {
                    warn!(job, size = chunk.len(), error = %e, "Batch write failed, deferring to next page");
                    stats.errors += chunk.len() as u64;
                    failed.extend_from_slice(chunk);
                }
            }
        }

        failed
    }

    /// One retry for records whose batch failed on an earlier page.
    async fn retry_pending(&self, run: &mut RunContext) {
        let items = std::mem::take(&mut run.pending_retry);
        let job = run.job.clone();
        let count = items.len() as u64;
        info!(job = %job, count, "Retrying deferred batch writes");

        let mut retry = MigrationStats::default();
        let failed = self.write_items(&job, items, &mut retry).await;
        // Errors were counted when these batches first failed
        run.stats.migrated += retry.migrated;
        run.stats.bump("retried", retry.migrated);
        run.stats.bump("retryFailures", count - retry.migrated);

        if !failed.is_empty() {
            self.warn(
                &job,
                format!(
                    "{} records failed again and are left for the next full run",
                    failed.len()
                ),
            );
        }
    }

    // =========================================================================
    // Index-repair jobs
    // =========================================================================

    async fn repair_page(
        &self,
        job: &dyn IndexRepair,
        run: &mut RunContext,
        items: Vec<Item>,
    ) -> MigrationStats {
        let ids: Vec<String> = items.iter().filter_map(|i| job.entity_id_of(i)).collect();
        let mut stats = MigrationStats {
            total: ids.len() as u64,
            ..Default::default()
        };
        let reconciler = IndexReconciler::new(&self.ctx, job.indexed_entity(), job.owner_lookup());
        let mode = self.apply_mode();

        // Derivation, diff and writes are interleaved per entity
        run.enter(RunPhase::Writing);
        for chunk in ids.chunks(self.ctx.concurrency.max(1)) {
            let results = join_all(chunk.iter().map(|id| reconciler.reconcile(id, None, mode))).await;
            for (id, result) in chunk.iter().zip(results) {
                match result {
                    Ok(report) => self.count_reconcile(&report.outcome, &mut stats),
                    Err(ReconcileError::EntityNotFound { .. }) => {
                        debug!(job = job.name(), id = %id, "Entity disappeared before reconciliation");
                        stats.skipped += 1;
                    }
                    Err(e) => {
                        warn!(job = job.name(), id = %id, error = %e, "Reconciliation failed");
                        stats.errors += 1;
                    }
                }
            }
        }

        stats
    }

    fn count_reconcile(&self, outcome: &ReconcileOutcome, stats: &mut MigrationStats) {
        stats.bump("added", outcome.added as u64);
        stats.bump("removed", outcome.removed as u64);
        stats.bump("unchanged", outcome.unchanged as u64);
        if outcome.owner_fixed {
            stats.bump("ownersFixed", 1);
        }

        if !outcome.has_changes() {
            stats.skipped += 1;
        } else if self.ctx.dry_run {
            stats.bump("wouldMigrate", 1);
        } else {
            stats.migrated += 1;
        }
    }

    // =========================================================================
    // Single entity
    // =========================================================================

    /// Run one entity through a job with step-by-step output. Writes only
    /// when the context is not a dry run; never touches checkpoints.
    pub async fn run_entity(
        &self,
        entry: &MigrationEntry,
        id: &str,
        owner_hint: Option<&str>,
    ) -> Result<EntityReport, MigrationError> {
        let mut report = EntityReport {
            job: entry.name().to_string(),
            entity_id: id.to_string(),
            result: MigrationResult::Skipped,
            steps: Vec::new(),
            reconcile: None,
        };

        match &entry.job {
            JobKind::Migrate(m) => self.copy_entity(m.as_ref(), id, &mut report).await?,
            JobKind::Repair(r) => self.repair_entity(r.as_ref(), id, owner_hint, &mut report).await?,
        }

        let result = format!("Result: {}", report.result.as_str());
        self.step(&mut report, result);
        Ok(report)
    }

    fn step(&self, report: &mut EntityReport, message: String) {
        info!(job = %report.job, entity = %report.entity_id, "{}", message);
        self.progress.emit(ProgressEvent::Step {
            job: report.job.clone(),
            message: message.clone(),
        });
        report.steps.push(message);
    }

    fn entity_result(&self, changed: bool) -> MigrationResult {
        match (changed, self.ctx.dry_run) {
            (true, true) => MigrationResult::WouldMigrate,
            (true, false) => MigrationResult::Migrated,
            (false, true) => MigrationResult::WouldSkip,
            (false, false) => MigrationResult::Skipped,
        }
    }

    async fn copy_entity(
        &self,
        job: &dyn DataMigration,
        id: &str,
        report: &mut EntityReport,
    ) -> Result<(), MigrationError> {
        let table = job.source_table(&self.ctx);
        self.step(report, format!("Fetching {} from {}", id, table));

        let Some(item) = self.ctx.store.get(&table, &PrimaryKey::partition(id)).await? else {
            self.step(report, "Not found in source table".to_string());
            report.result = self.entity_result(false);
            return Ok(());
        };
        self.step(report, format!("Source: {}", item.to_json()));

        let source = SourceRecord::new(item);
        let transformed = job
            .transform(&source, &self.ctx)
            .await
            .map_err(|source| MigrationError::Transform {
                id: id.to_string(),
                source,
            })?;

        let records = match transformed {
            Transformed::Skip(reason) => {
                self.step(report, format!("Invalid source record: {}", reason));
                report.result = self.entity_result(false);
                return Ok(());
            }
            Transformed::Records(records) => records,
        };

        for record in &records {
            self.step(report, format!("Destination key {}", record.key));
            for (n, gsi) in &record.gsi {
                self.step(report, format!("GSI{}: {} / {}", n, gsi.pk, gsi.sk));
            }
        }

        let filter = ExistenceFilter::new(
            self.ctx.store.as_ref(),
            &self.ctx.destination_table,
            job.existence_policy(),
            1,
        );
        let filtered = filter
            .filter(records, |record| job.existence_key_of(record))
            .await;
        self.step(
            report,
            format!(
                "Existence check ({}): {} present, {} to write, {} check failures",
                job.existence_policy().as_str(),
                filtered.skipped,
                filtered.to_write.len(),
                filtered.check_failures
            ),
        );

        if filtered.to_write.is_empty() || self.ctx.dry_run {
            report.result = self.entity_result(!filtered.to_write.is_empty());
            return Ok(());
        }

        let mut stats = MigrationStats::default();
        let items = filtered.to_write.iter().map(DestinationRecord::to_item).collect();
        let failed = self.write_items(job.name(), items, &mut stats).await;
        if stats.errors > 0 || !failed.is_empty() {
            return Err(MigrationError::WriteFailed {
                id: id.to_string(),
                count: stats.errors,
            });
        }
        self.step(report, format!("Wrote {} records", stats.migrated));
        report.result = self.entity_result(true);
        Ok(())
    }

    async fn repair_entity(
        &self,
        job: &dyn IndexRepair,
        id: &str,
        owner_hint: Option<&str>,
        report: &mut EntityReport,
    ) -> Result<(), MigrationError> {
        let reconciler = IndexReconciler::new(&self.ctx, job.indexed_entity(), job.owner_lookup());
        self.step(report, format!("Reconciling {} {}", job.entity_label(), id));

        let reconciled = match reconciler.reconcile(id, owner_hint, self.apply_mode()).await {
            Ok(reconciled) => reconciled,
            Err(ReconcileError::EntityNotFound { .. }) => {
                self.step(report, format!("{} not found", job.entity_label()));
                report.result = self.entity_result(false);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(owner) = &reconciled.owner {
            let state = if reconciled.outcome.owner_fixed { "repaired" } else { "ok" };
            self.step(report, format!("Owner {} ({})", owner, state));
        }
        for hash in &reconciled.removed_hashes {
            self.step(report, format!("Remove {}", hash));
        }
        for hash in &reconciled.added_hashes {
            self.step(report, format!("Add {}", hash));
        }
        self.step(
            report,
            format!(
                "{} added, {} removed, {} unchanged",
                reconciled.outcome.added, reconciled.outcome.removed, reconciled.outcome.unchanged
            ),
        );

        report.result = self.entity_result(reconciled.outcome.has_changes());
        report.reconcile = Some(reconciled.outcome);
        Ok(())
    }
}
