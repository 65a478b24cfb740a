//! Batch runner behavior: idempotence, resumption, error isolation and the
//! error budget.

mod common;

use common::*;
use migrator_core::data_migrations::migrate_users::MigrateUsersMigration;
use migrator_core::data_migrations::{
    Checkpoint, MemoryCheckpointStore, MigrationEntry, MigrationStats, ProgressEvent, RunOptions,
    RunOutcome, StartMode,
};
use migrator_core::kernel::{Cursor, Item, MockStoreClient, PrimaryKey};
use serde_json::json;

fn widgets_job() -> MigrationEntry {
    MigrationEntry::migration(CopyWidgets)
}

async fn widget_harness(rows: Vec<serde_json::Value>) -> TestHarness {
    TestHarness::new(MockStoreClient::from_store(
        seeded_store(WIDGETS_TABLE, rows).await,
    ))
}

#[tokio::test]
async fn scenario_invalid_owner_is_skipped() {
    let harness = widget_harness(vec![
        json!({"id": "a", "owner": "u1"}),
        json!({"id": "b", "owner": null}),
        json!({"id": "c", "owner": "u2"}),
    ])
    .await;

    let summary = harness.run(&widgets_job(), RunOptions::default()).await;

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.stats.migrated, 2);
    assert_eq!(summary.stats.skipped, 1);
    assert_eq!(summary.stats.errors, 0);
    let store = harness.store.store();
    assert!(store.contains(DEST_TABLE, &widget_key("a")).await);
    assert!(!store.contains(DEST_TABLE, &widget_key("b")).await);
    assert!(store.contains(DEST_TABLE, &widget_key("c")).await);
    assert_eq!(store.len(DEST_TABLE).await, 2);
}

#[tokio::test]
async fn second_run_migrates_nothing() {
    let harness = widget_harness(widgets(5)).await;
    let job = widgets_job();

    let first = harness.run(&job, RunOptions::default()).await;
    assert_eq!(first.stats.migrated, 5);
    let after_first = harness.store.store().dump().await;

    let second = harness.run(&job, RunOptions::default()).await;
    assert_eq!(second.outcome, RunOutcome::Completed);
    assert_eq!(second.stats.total, 5);
    assert_eq!(second.stats.migrated, 0);
    assert_eq!(second.stats.skipped, 5);
    assert_eq!(harness.store.store().dump().await, after_first);
}

#[tokio::test]
async fn completed_run_clears_checkpoint() {
    let harness = widget_harness(widgets(5)).await;

    let summary = harness.run(&widgets_job(), RunOptions::default()).await;

    assert_eq!(summary.batches, 3);
    assert_eq!(summary.checkpoint, None);
    // Pages 1 and 2 are checkpointed, the last page is not
    assert_eq!(harness.checkpoints.save_count(), 2);
    assert!(harness.checkpoints.get("copy_widgets").is_none());
}

#[tokio::test]
async fn resumed_run_matches_uninterrupted_run() {
    let uninterrupted = widget_harness(widgets(6)).await;
    let expected = uninterrupted.run(&widgets_job(), RunOptions::default()).await;

    let harness = widget_harness(widgets(6)).await;
    let stopped = harness
        .run(
            &widgets_job(),
            RunOptions {
                max_pages: Some(1),
                ..Default::default()
            },
        )
        .await;
    assert_eq!(stopped.outcome, RunOutcome::Stopped { pages: 1 });
    assert_eq!(stopped.outcome.exit_code(), 1);

    let saved = harness.checkpoints.get("copy_widgets").expect("checkpoint kept");
    assert_eq!(saved.batch_number, 1);
    assert_eq!(saved.cursor, Some(Cursor::after(&PrimaryKey::partition("w02"))));

    harness.store.reset_calls();
    let resumed = harness.run(&widgets_job(), RunOptions::default()).await;

    assert_eq!(harness.store.scan_calls()[0].cursor, saved.cursor);
    assert_eq!(resumed.outcome, RunOutcome::Completed);
    assert_eq!(resumed.stats, expected.stats);
    assert_eq!(resumed.batches, expected.batches);
}

#[tokio::test]
async fn stop_after_failed_batch_loses_no_records_on_resume() {
    let store = seeded_store(WIDGETS_TABLE, widgets(4)).await;
    let harness = TestHarness::new(MockStoreClient::from_store(store).with_failing_batch_writes(1));

    let stopped = harness
        .run(
            &widgets_job(),
            RunOptions {
                max_pages: Some(1),
                ..Default::default()
            },
        )
        .await;
    assert_eq!(stopped.outcome, RunOutcome::Stopped { pages: 1 });
    let saved = harness.checkpoints.get("copy_widgets").expect("checkpoint kept");
    assert!(saved.pending_retry.is_empty());

    let resumed = harness.run(&widgets_job(), RunOptions::default()).await;

    assert_eq!(resumed.outcome, RunOutcome::Completed);
    assert_eq!(resumed.stats.migrated, 4);
    assert_eq!(resumed.stats.errors, 2);
    assert_eq!(resumed.stats.extra("retried"), 2);
    assert_eq!(harness.store.store().len(DEST_TABLE).await, 4);
}

#[tokio::test]
async fn pending_retries_in_checkpoint_are_written_on_resume() {
    let pending = Item::from_json(json!({
        "PK": "WIDGET#w01",
        "SK": "WIDGET",
        "item": {"id": "w01", "owner": "u1"}
    }))
    .unwrap();
    let saved = Checkpoint::new(
        Some(Cursor::after(&PrimaryKey::partition("w02"))),
        MigrationStats {
            total: 2,
            migrated: 1,
            errors: 1,
            ..Default::default()
        },
        1,
    )
    .with_pending_retry(vec![pending]);
    let harness = widget_harness(widgets(4))
        .await
        .with_checkpoints(MemoryCheckpointStore::new().with_checkpoint("copy_widgets", saved));

    let summary = harness.run(&widgets_job(), RunOptions::default()).await;

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert!(harness.store.store().contains(DEST_TABLE, &widget_key("w01")).await);
    assert_eq!(summary.stats.extra("retried"), 1);
    assert_eq!(summary.stats.migrated, 4);
}

#[tokio::test]
async fn resume_starts_at_saved_cursor() {
    let cursor = Cursor::after(&PrimaryKey::partition("w03"));
    let saved = Checkpoint::new(
        Some(cursor.clone()),
        MigrationStats {
            total: 500,
            migrated: 480,
            skipped: 20,
            ..Default::default()
        },
        7,
    );
    let harness = widget_harness(widgets(5))
        .await
        .with_checkpoints(MemoryCheckpointStore::new().with_checkpoint("copy_widgets", saved));

    let summary = harness
        .run(
            &widgets_job(),
            RunOptions {
                start: StartMode::Resume,
                ..Default::default()
            },
        )
        .await;

    assert_eq!(harness.store.scan_calls()[0].cursor, Some(cursor));
    assert_eq!(summary.stats.total, 502);
    assert_eq!(summary.stats.migrated, 482);
    assert_eq!(summary.batches, 8);
    assert!(matches!(
        harness.events().first(),
        Some(ProgressEvent::RunStarted { resumed: true, batch_number: 7, .. })
    ));
}

#[tokio::test]
async fn reset_ignores_saved_checkpoint() {
    let saved = Checkpoint::new(
        Some(Cursor::after(&PrimaryKey::partition("w04"))),
        MigrationStats::default(),
        2,
    );
    let harness = widget_harness(widgets(4))
        .await
        .with_checkpoints(MemoryCheckpointStore::new().with_checkpoint("copy_widgets", saved));

    let summary = harness
        .run(
            &widgets_job(),
            RunOptions {
                start: StartMode::Reset,
                ..Default::default()
            },
        )
        .await;

    assert_eq!(harness.store.scan_calls()[0].cursor, None);
    assert_eq!(summary.stats.migrated, 4);
}

#[tokio::test]
async fn failing_transform_is_isolated() {
    let mut rows = widgets(4);
    rows[1]["explode"] = json!(true);
    let harness = widget_harness(rows).await;

    let summary = harness.run(&widgets_job(), RunOptions::default()).await;

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.stats.total, 4);
    assert_eq!(summary.stats.migrated, 3);
    assert_eq!(summary.stats.errors, 1);
    assert!(!harness.store.store().contains(DEST_TABLE, &widget_key("w02")).await);
}

#[tokio::test]
async fn exceeding_error_budget_aborts_and_keeps_checkpoint() {
    let rows = widgets(6)
        .into_iter()
        .map(|mut row| {
            row["explode"] = json!(true);
            row
        })
        .collect();
    let harness = widget_harness(rows).await;

    let summary = harness
        .run(
            &widgets_job(),
            RunOptions {
                error_budget: Some(2),
                ..Default::default()
            },
        )
        .await;

    assert_eq!(summary.outcome, RunOutcome::Aborted { errors: 4, budget: 2 });
    assert_eq!(summary.outcome.exit_code(), 1);
    assert_eq!(summary.batches, 2);
    assert_eq!(summary.checkpoint.as_deref(), Some("memory://copy_widgets"));

    let saved = harness.checkpoints.get("copy_widgets").expect("checkpoint kept");
    assert_eq!(saved.batch_number, 2);
    assert_eq!(saved.stats.errors, 4);
    // The third page was never scanned
    assert_eq!(harness.store.scan_calls().len(), 2);
}

#[tokio::test]
async fn budget_is_not_exceeded_at_equality() {
    let mut rows = widgets(4);
    rows[0]["explode"] = json!(true);
    rows[3]["explode"] = json!(true);
    let harness = widget_harness(rows).await;

    let summary = harness
        .run(
            &widgets_job(),
            RunOptions {
                error_budget: Some(2),
                ..Default::default()
            },
        )
        .await;

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.stats.errors, 2);
}

#[tokio::test]
async fn failed_batch_is_retried_at_next_page() {
    let store = seeded_store(WIDGETS_TABLE, widgets(4)).await;
    let harness = TestHarness::new(MockStoreClient::from_store(store).with_failing_batch_writes(1));

    let summary = harness.run(&widgets_job(), RunOptions::default()).await;

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.stats.migrated, 4);
    // Errors counted at the failure are never taken back
    assert_eq!(summary.stats.errors, 2);
    assert_eq!(summary.stats.extra("retried"), 2);
    assert_eq!(harness.store.store().len(DEST_TABLE).await, 4);
}

#[tokio::test]
async fn unprocessed_items_are_errors() {
    let store = seeded_store(WIDGETS_TABLE, widgets(3)).await;
    let harness =
        TestHarness::new(MockStoreClient::from_store(store).with_unprocessed("WIDGET#w02"));

    let summary = harness.run(&widgets_job(), RunOptions::default()).await;

    assert_eq!(summary.stats.migrated, 2);
    assert_eq!(summary.stats.errors, 1);
    assert!(!harness.store.store().contains(DEST_TABLE, &widget_key("w02")).await);
}

#[tokio::test]
async fn failed_scan_retries_same_cursor() {
    let store = seeded_store(WIDGETS_TABLE, widgets(3)).await;
    let harness = TestHarness::new(MockStoreClient::from_store(store).with_failing_scans(1));

    let summary = harness.run(&widgets_job(), RunOptions::default()).await;

    let calls = harness.store.scan_calls();
    assert_eq!(calls[0].cursor, None);
    assert_eq!(calls[1].cursor, None);
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.stats.errors, 1);
    assert_eq!(summary.stats.migrated, 3);
}

#[tokio::test]
async fn checkpoint_save_failure_does_not_stop_the_run() {
    let harness = widget_harness(widgets(4))
        .await
        .with_checkpoints(MemoryCheckpointStore::new().with_failing_saves());

    let summary = harness.run(&widgets_job(), RunOptions::default()).await;

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.stats.migrated, 4);
    assert!(harness
        .events()
        .iter()
        .any(|e| matches!(e, ProgressEvent::CheckpointFailed { batch_number: 1, .. })));
}

#[tokio::test]
async fn dry_run_writes_nothing() {
    let harness = widget_harness(widgets(3)).await.dry_run();

    let summary = harness.run(&widgets_job(), RunOptions::default()).await;

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert!(summary.dry_run);
    assert_eq!(summary.stats.migrated, 0);
    assert_eq!(summary.stats.extra("wouldMigrate"), 3);
    assert!(harness.store.written_keys().is_empty());
    assert_eq!(harness.checkpoints.save_count(), 0);
}

#[tokio::test]
async fn page_size_override_is_used() {
    let harness = widget_harness(widgets(5)).await;

    let summary = harness
        .run(
            &widgets_job(),
            RunOptions {
                page_size: Some(10),
                ..Default::default()
            },
        )
        .await;

    assert_eq!(summary.batches, 1);
    assert_eq!(harness.store.scan_calls()[0].limit, 10);
}

#[tokio::test]
async fn users_are_not_overwritten_when_existence_is_unknown() {
    let store = seeded_store(
        "LOCAL_USERS",
        vec![
            json!({"id": "u1", "username": "Alice"}),
            json!({"id": "u2", "username": "Bob"}),
        ],
    )
    .await;
    let harness = TestHarness::new(MockStoreClient::from_store(store).with_failing_get("USER#u1"));

    let summary = harness
        .run(
            &MigrationEntry::migration(MigrateUsersMigration),
            RunOptions::default(),
        )
        .await;

    assert_eq!(summary.stats.migrated, 1);
    assert_eq!(summary.stats.skipped, 1);
    assert_eq!(summary.stats.extra("existenceCheckFailures"), 1);
    assert_eq!(
        harness.store.written_keys(),
        vec![PrimaryKey::new("USER#u2", "USER")]
    );
}

#[tokio::test]
async fn widgets_are_written_when_existence_is_unknown() {
    let store = seeded_store(WIDGETS_TABLE, widgets(1)).await;
    let harness = TestHarness::new(MockStoreClient::from_store(store).with_failing_get("WIDGET#w01"));

    let summary = harness.run(&widgets_job(), RunOptions::default()).await;

    assert_eq!(summary.stats.migrated, 1);
    assert_eq!(summary.stats.extra("existenceCheckFailures"), 1);
}

#[tokio::test]
async fn batch_progress_is_reported_per_page() {
    let harness = widget_harness(widgets(5)).await;

    harness.run(&widgets_job(), RunOptions::default()).await;

    let batches: Vec<u64> = harness
        .events()
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::BatchCompleted { batch_number, .. } => Some(*batch_number),
            _ => None,
        })
        .collect();
    assert_eq!(batches, vec![1, 2, 3]);
    assert!(matches!(
        harness.events().last(),
        Some(ProgressEvent::RunFinished { outcome, .. }) if outcome == "complete"
    ));
}
