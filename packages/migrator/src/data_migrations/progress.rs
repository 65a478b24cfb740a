//! Progress reporting for migration runs.
//!
//! The runner emits [`ProgressEvent`]s into an unbounded channel; a spawned
//! task drains it into a [`ProgressSink`]. Emitting never waits on output.
//!
//! # Usage
//!
//!   let reporter = ProgressReporter::spawn(LineSink::new(OutputFormat::Text));
//!   let runner = BatchRunner::new(ctx, checkpoints, reporter.handle());
//!   ...
//!   drop(runner);
//!   reporter.finish().await;

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::stats::MigrationStats;

const RULER_WIDTH: usize = 80;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    RunStarted {
        job: String,
        run_id: Uuid,
        resumed: bool,
        batch_number: u64,
        dry_run: bool,
    },
    BatchCompleted {
        job: String,
        batch_number: u64,
        page_records: usize,
        stats: MigrationStats,
    },
    CheckpointSaved {
        job: String,
        batch_number: u64,
        location: String,
    },
    CheckpointFailed {
        job: String,
        batch_number: u64,
        message: String,
    },
    Warning {
        job: String,
        message: String,
    },
    /// Verbose single-entity output
    Step {
        job: String,
        message: String,
    },
    RunFinished {
        job: String,
        outcome: String,
        stats: MigrationStats,
        batches: u64,
        elapsed_ms: u64,
        dry_run: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        checkpoint: Option<String>,
    },
}

pub trait ProgressSink: Send + 'static {
    fn emit(&mut self, event: &ProgressEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    /// One JSON object per line
    Json,
}

/// Writes events to stdout.
pub struct LineSink {
    format: OutputFormat,
    log_every: u64,
}

impl LineSink {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            log_every: 1,
        }
    }

    /// Only print every `n`th batch line (text output).
    pub fn log_every(mut self, n: u64) -> Self {
        self.log_every = n.max(1);
        self
    }
}

impl ProgressSink for LineSink {
    fn emit(&mut self, event: &ProgressEvent) {
        match self.format {
            OutputFormat::Json => {
                if let Ok(line) = serde_json::to_string(event) {
                    println!("{}", line);
                }
            }
            OutputFormat::Text => {
                if let ProgressEvent::BatchCompleted { batch_number, .. } = event {
                    if batch_number % self.log_every != 0 {
                        return;
                    }
                }
                println!("{}", render_text(event));
            }
        }
    }
}

/// Human-readable rendering of one event.
pub fn render_text(event: &ProgressEvent) -> String {
    match event {
        ProgressEvent::RunStarted {
            job,
            run_id,
            resumed,
            batch_number,
            dry_run,
        } => {
            let mode = if *dry_run { " (dry run)" } else { "" };
            if *resumed {
                format!(
                    "Starting {}{} run {}, resuming after batch {}",
                    job, mode, run_id, batch_number
                )
            } else {
                format!("Starting {}{} run {}", job, mode, run_id)
            }
        }
        ProgressEvent::BatchCompleted {
            batch_number,
            stats,
            ..
        } => format!(
            "Progress: Batch {} | {} migrated, {} skipped, {} errors",
            batch_number, stats.migrated, stats.skipped, stats.errors
        ),
        ProgressEvent::CheckpointSaved {
            batch_number,
            location,
            ..
        } => format!("Checkpoint saved: batch {} -> {}", batch_number, location),
        ProgressEvent::CheckpointFailed {
            batch_number,
            message,
            ..
        } => format!(
            "Warning: checkpoint for batch {} not saved: {}",
            batch_number, message
        ),
        ProgressEvent::Warning { message, .. } => format!("Warning: {}", message),
        ProgressEvent::Step { message, .. } => format!("  - {}", message),
        ProgressEvent::RunFinished {
            job,
            outcome,
            stats,
            batches,
            elapsed_ms,
            dry_run,
            checkpoint,
        } => render_summary(
            job,
            outcome,
            stats,
            *batches,
            *elapsed_ms,
            *dry_run,
            checkpoint.as_deref(),
        ),
    }
}

fn render_summary(
    job: &str,
    outcome: &str,
    stats: &MigrationStats,
    batches: u64,
    elapsed_ms: u64,
    dry_run: bool,
    checkpoint: Option<&str>,
) -> String {
    let ruler = "=".repeat(RULER_WIDTH);
    let mut lines = vec![
        String::new(),
        ruler.clone(),
        format!(
            "{} {}{}",
            job.to_uppercase(),
            outcome.to_uppercase(),
            if dry_run { " (DRY RUN)" } else { "" }
        ),
        ruler.clone(),
        format!("Total records:   {}", stats.total),
        format!("Migrated:        {}", stats.migrated),
        format!("Skipped:         {}", stats.skipped),
        format!("Errors:          {}", stats.errors),
    ];
    for (name, value) in &stats.extra {
        lines.push(format!("{:<17}{}", format!("{}:", name), value));
    }
    lines.push(format!("Batches:         {}", batches));
    lines.push(format!(
        "Elapsed:         {:.1}s",
        elapsed_ms as f64 / 1000.0
    ));
    if let Some(location) = checkpoint {
        lines.push(format!("Checkpoint kept: {}", location));
        lines.push("Re-run the same command to resume.".to_string());
    }
    lines.push(ruler);
    lines.join("\n")
}

/// Keeps every event in memory (tests, single-entity reports).
#[derive(Clone, Default)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl ProgressSink for CollectingSink {
    fn emit(&mut self, event: &ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Cloneable sending side used by the runner.
#[derive(Clone)]
pub struct ProgressHandle {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ProgressHandle {
    /// A handle whose events go nowhere.
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    pub fn emit(&self, event: ProgressEvent) {
        // Ignore send errors (reporter already finished)
        let _ = self.tx.send(event);
    }
}

pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<ProgressEvent>,
    task: JoinHandle<()>,
}

impl ProgressReporter {
    /// Start the consumer task. Must be called within a tokio runtime.
    pub fn spawn<S: ProgressSink>(mut sink: S) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.emit(&event);
            }
        });
        Self { tx, task }
    }

    pub fn handle(&self) -> ProgressHandle {
        ProgressHandle {
            tx: self.tx.clone(),
        }
    }

    /// Wait until every emitted event has reached the sink.
    ///
    /// Outstanding [`ProgressHandle`]s must be dropped first.
    pub async fn finish(self) {
        drop(self.tx);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(n: u64) -> ProgressEvent {
        ProgressEvent::BatchCompleted {
            job: "job".into(),
            batch_number: n,
            page_records: 10,
            stats: MigrationStats {
                total: 10 * n,
                migrated: 8 * n,
                skipped: 2 * n,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_batch_line_format() {
        assert_eq!(
            render_text(&batch(3)),
            "Progress: Batch 3 | 24 migrated, 6 skipped, 0 errors"
        );
    }

    #[test]
    fn test_summary_lists_job_counters() {
        let mut stats = MigrationStats::default();
        stats.bump("ownersFixed", 2);
        let text = render_text(&ProgressEvent::RunFinished {
            job: "repair_cube_hashes".into(),
            outcome: "aborted".into(),
            stats,
            batches: 4,
            elapsed_ms: 1500,
            dry_run: false,
            checkpoint: Some("temp/repair_cube_hashes-checkpoint.json".into()),
        });
        assert!(text.contains(&"=".repeat(80)));
        assert!(text.contains("REPAIR_CUBE_HASHES ABORTED"));
        assert!(text.contains("ownersFixed:"));
        assert!(text.contains("Checkpoint kept: temp/repair_cube_hashes-checkpoint.json"));
    }

    #[test]
    fn test_json_events_are_tagged() {
        let value = serde_json::to_value(batch(1)).unwrap();
        assert_eq!(value["type"], "batch_completed");
        assert_eq!(value["stats"]["migrated"], 8);
    }

    #[tokio::test]
    async fn test_reporter_delivers_in_order() {
        let sink = CollectingSink::new();
        let reporter = ProgressReporter::spawn(sink.clone());
        let handle = reporter.handle();
        for n in 1..=3 {
            handle.emit(batch(n));
        }
        drop(handle);
        reporter.finish().await;

        let batches: Vec<u64> = sink
            .events()
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::BatchCompleted { batch_number, .. } => Some(*batch_number),
                _ => None,
            })
            .collect();
        assert_eq!(batches, vec![1, 2, 3]);
    }
}
