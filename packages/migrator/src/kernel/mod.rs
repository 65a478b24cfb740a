//! Kernel module - storage infrastructure the migration engine runs on.

pub mod blob_store;
pub mod error;
pub mod file_store;
pub mod memory_store;
pub mod retry;
pub mod test_dependencies;
pub mod traits;
pub mod types;

pub use blob_store::{DirBlobStore, MemoryBlobStore};
pub use error::{StoreError, StoreResult};
pub use file_store::FileStore;
pub use memory_store::MemoryStore;
pub use retry::{RetryPolicy, RetryingStore};
pub use test_dependencies::{MockStoreClient, Mutation, ScanCall};
pub use traits::*;
pub use types::*;
