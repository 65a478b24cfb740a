//! CLI for executing data migrations and index repairs
//!
//! Progress goes to stdout (text or JSON lines), logs go to stderr.
//! Exits 0 when the job ran to completion and 1 otherwise.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use migrator_core::config::Config;
use migrator_core::data_migrations::repair_cube_hashes::REPAIR_CUBE_HASHES;
use migrator_core::data_migrations::{
    all_migrations, find_migration, BatchRunner, CheckpointStore, FileCheckpointStore, LineSink,
    MigrationContext, MigrationEntry, OutputFormat, ProgressReporter, RunOptions, StartMode,
};
use migrator_core::kernel::{DirBlobStore, FileStore, RetryingStore};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "migrate_cli")]
#[command(about = "Checkpointed single-table migrations and index repairs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all registered jobs
    List,

    /// Run a job (resumes from its checkpoint by default)
    Run(RunArgs),

    /// Show the saved checkpoint of a job
    Status { name: String },
}

#[derive(Args)]
struct RunArgs {
    name: String,

    /// Continue from the saved checkpoint (default)
    #[arg(long)]
    resume: bool,

    /// Delete the saved checkpoint and start from the beginning
    #[arg(long, conflicts_with = "resume")]
    reset: bool,

    /// Compute everything, write nothing, leave the checkpoint alone
    #[arg(long)]
    dry_run: bool,

    /// Emit progress as JSON lines
    #[arg(long)]
    json: bool,

    #[arg(long)]
    page_size: Option<usize>,

    #[arg(long)]
    error_budget: Option<u64>,

    /// Stop after this many pages, keeping the checkpoint
    #[arg(long)]
    max_pages: Option<u64>,

    /// Only print every Nth batch line
    #[arg(long, default_value_t = 1)]
    log_every: u64,

    /// Dry-run a single entity with step-by-step output
    #[arg(
        long,
        value_name = "ID",
        aliases = ["test-cube", "test-user", "test-draft", "test-changelog"],
        conflicts_with = "entity"
    )]
    test_entity: Option<String>,

    /// Run a single entity for real
    #[arg(long, value_name = "ID", alias = "cubeid")]
    entity: Option<String>,

    /// Owner to use when the entity has none
    #[arg(long)]
    owner: Option<String>,
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let verbose = matches!(&cli.command, Commands::Run(args) if args.test_entity.is_some());
    let default_filter = if verbose {
        "debug,migrator_core=debug"
    } else {
        "info,migrator_core=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let code = match cli.command {
        Commands::List => cmd_list(),
        Commands::Run(args) => cmd_run(args).await?,
        Commands::Status { name } => cmd_status(&name).await?,
    };

    std::process::exit(code)
}

fn lookup(name: &str) -> Option<MigrationEntry> {
    let entry = find_migration(name);
    if entry.is_none() {
        error!(job = name, "Migration not found");
        eprintln!("Migration '{}' not found. Run `migrate_cli list` to see jobs.", name);
    }
    entry
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_list() -> i32 {
    for entry in all_migrations() {
        println!(
            "{:<22} {:<8} {}",
            entry.name(),
            entry.kind(),
            entry.description()
        );
    }
    0
}

async fn cmd_run(args: RunArgs) -> Result<i32> {
    let config = Config::from_env()?;
    let Some(entry) = lookup(&args.name) else {
        return Ok(1);
    };

    let policy = config.retry_policy();
    let store = FileStore::open(&config.store_file)
        .await
        .with_context(|| format!("Failed to open store {}", config.store_file.display()))?;
    let blobs = DirBlobStore::new(&config.blob_dir);

    let single = single_entity(&args, entry.name(), config.cube_id.as_deref());
    let ctx = MigrationContext::new(
        Arc::new(RetryingStore::new(store, policy.clone())),
        Arc::new(RetryingStore::new(blobs, policy)),
        config.dynamo_table.clone(),
    )
    .with_legacy_prefix(config.dynamo_prefix.clone())
    .with_dry_run(args.dry_run || args.test_entity.is_some())
    .with_concurrency(config.concurrency)
    .with_card_hashes(config.maintain_card_hashes);

    let format = if args.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };
    let reporter = ProgressReporter::spawn(LineSink::new(format).log_every(args.log_every));
    let checkpoints = Arc::new(FileCheckpointStore::new(&config.checkpoint_dir));
    let runner = BatchRunner::new(ctx, checkpoints, reporter.handle());

    let code = match single {
        Some(id) => {
            info!(job = entry.name(), entity = %id, "Running single entity");
            match runner.run_entity(&entry, &id, args.owner.as_deref()).await {
                Ok(_) => 0,
                Err(e) => {
                    error!(job = entry.name(), entity = %id, error = %e, "Entity run failed");
                    1
                }
            }
        }
        None => {
            let opts = RunOptions {
                start: if args.reset {
                    StartMode::Reset
                } else {
                    StartMode::Resume
                },
                page_size: args.page_size,
                error_budget: args.error_budget,
                max_pages: args.max_pages,
            };
            match runner.run(&entry, &opts).await {
                Ok(summary) => summary.outcome.exit_code(),
                Err(e) => {
                    error!(job = entry.name(), error = %e, "Migration run failed");
                    1
                }
            }
        }
    };

    drop(runner);
    reporter.finish().await;
    Ok(code)
}

/// The entity a run is restricted to, if any. `CUBE_ID` from the
/// environment only narrows the cube repair.
fn single_entity(args: &RunArgs, job: &str, cube_id: Option<&str>) -> Option<String> {
    args.test_entity
        .clone()
        .or_else(|| args.entity.clone())
        .or_else(|| match job {
            REPAIR_CUBE_HASHES => cube_id.map(str::to_string),
            _ => None,
        })
}

async fn cmd_status(name: &str) -> Result<i32> {
    let config = Config::from_env()?;
    let Some(entry) = lookup(name) else {
        return Ok(1);
    };

    let checkpoints = FileCheckpointStore::new(&config.checkpoint_dir);
    match checkpoints.load(entry.name()).await? {
        Some(checkpoint) => {
            println!("Checkpoint: {}", checkpoints.location(entry.name()));
            println!("{}", serde_json::to_string_pretty(&checkpoint)?);
        }
        None => println!("No checkpoint for {}", entry.name()),
    }
    Ok(0)
}
