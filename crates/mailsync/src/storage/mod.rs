//! Storage traits and implementations
//!
//! The sync engine only talks to [`SyncStore`]. Accounts, checkpoints,
//! records and run history are all partitioned by account id.

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemorySyncStore;
pub use sqlite::SqliteSyncStore;
pub use traits::{BatchCounts, SyncStore, UpsertAction};
