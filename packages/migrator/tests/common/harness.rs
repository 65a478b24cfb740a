//! Test harness: a mock store, in-memory blobs and checkpoints, and a
//! collecting progress sink wired into a `BatchRunner`.

use migrator_core::data_migrations::{
    BatchRunner, CollectingSink, MemoryCheckpointStore, MigrationContext, MigrationEntry,
    ProgressEvent, ProgressReporter, RunOptions, RunSummary,
};
use migrator_core::kernel::{MemoryBlobStore, MockStoreClient};
use std::sync::Arc;

use super::fixtures::DEST_TABLE;

pub struct TestHarness {
    pub store: MockStoreClient,
    pub blobs: MemoryBlobStore,
    pub checkpoints: Arc<MemoryCheckpointStore>,
    pub sink: CollectingSink,
    pub dry_run: bool,
}

impl TestHarness {
    pub fn new(store: MockStoreClient) -> Self {
        Self {
            store,
            blobs: MemoryBlobStore::new(),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            sink: CollectingSink::new(),
            dry_run: false,
        }
    }

    pub fn with_blobs(mut self, blobs: MemoryBlobStore) -> Self {
        self.blobs = blobs;
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: MemoryCheckpointStore) -> Self {
        self.checkpoints = Arc::new(checkpoints);
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn context(&self) -> MigrationContext {
        MigrationContext::new(
            Arc::new(self.store.clone()),
            Arc::new(self.blobs.clone()),
            DEST_TABLE,
        )
        .with_dry_run(self.dry_run)
        .with_concurrency(4)
    }

    /// Run the job to its end (or to `opts.max_pages`) and flush progress.
    pub async fn run(&self, entry: &MigrationEntry, opts: RunOptions) -> RunSummary {
        let reporter = ProgressReporter::spawn(self.sink.clone());
        let runner = BatchRunner::new(self.context(), self.checkpoints.clone(), reporter.handle());
        let summary = runner.run(entry, &opts).await.expect("run failed");
        drop(runner);
        reporter.finish().await;
        summary
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.sink.events()
    }
}
