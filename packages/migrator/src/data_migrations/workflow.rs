//! Run state for one migration execution.
//!
//! Owned by the batch runner and passed down explicitly; the checkpoint is a
//! snapshot of this struct taken at page boundaries.

use tracing::debug;
use uuid::Uuid;

use super::checkpoint::Checkpoint;
use super::stats::MigrationStats;
use crate::kernel::{Cursor, Item};

/// Phase of the page loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Scanning,
    Transforming,
    Filtering,
    Writing,
    Checkpointing,
    Draining,
    Done,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Transforming => "transforming",
            Self::Filtering => "filtering",
            Self::Writing => "writing",
            Self::Checkpointing => "checkpointing",
            Self::Draining => "draining",
            Self::Done => "done",
        }
    }
}

#[derive(Debug)]
pub struct RunContext {
    pub job: String,
    pub run_id: Uuid,
    /// Position of the next page to scan
    pub cursor: Option<Cursor>,
    pub stats: MigrationStats,
    pub batch_number: u64,
    pub phase: RunPhase,
    /// Items from whole-batch write failures, retried once at the next page
    /// boundary. Carried in the checkpoint until retried.
    pub pending_retry: Vec<Item>,
    pub resumed: bool,
    /// Whether a checkpoint for this job exists on disk
    pub has_checkpoint: bool,
}

impl RunContext {
    pub fn fresh(job: &str) -> Self {
        Self {
            job: job.to_string(),
            run_id: Uuid::new_v4(),
            cursor: None,
            stats: MigrationStats::default(),
            batch_number: 0,
            phase: RunPhase::Idle,
            pending_retry: Vec::new(),
            resumed: false,
            has_checkpoint: false,
        }
    }

    pub fn from_checkpoint(job: &str, checkpoint: Checkpoint) -> Self {
        Self {
            cursor: checkpoint.cursor,
            stats: checkpoint.stats,
            batch_number: checkpoint.batch_number,
            pending_retry: checkpoint.pending_retry,
            resumed: true,
            has_checkpoint: true,
            ..Self::fresh(job)
        }
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint::new(self.cursor.clone(), self.stats.clone(), self.batch_number)
            .with_pending_retry(self.pending_retry.clone())
    }

    pub fn enter(&mut self, phase: RunPhase) {
        if self.phase != phase {
            debug!(
                job = %self.job,
                batch = self.batch_number,
                from = self.phase.as_str(),
                to = phase.as_str(),
                "Run phase change"
            );
            self.phase = phase;
        }
    }

    /// Errors strictly above the budget abort the run.
    pub fn error_budget_exceeded(&self, budget: u64) -> bool {
        self.stats.errors > budget
    }
}
