//! Mailsync crate - incremental mailbox synchronization
//!
//! This crate provides the pieces needed to keep a local copy of remote
//! mailboxes up to date:
//! - Domain models (Account, Record, Checkpoint, SyncRun)
//! - Storage trait with SQLite and in-memory implementations
//! - Fetch client trait with spool-directory and in-memory implementations
//! - Resumable, idempotent sync engine with per-record failure isolation
//! - Background scheduler and lifecycle supervisor
//!
//! Everything is blocking and thread-based; no async runtime is required.

pub mod clock;
pub mod config;
pub mod error;
pub mod fetch;
pub mod models;
pub mod scheduler;
pub mod storage;
pub mod supervisor;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, SyncConfig};
pub use error::{ErrorKind, FetchError, SyncError};
pub use fetch::{FetchClient, InMemoryFetchClient, Page, SpoolFetchClient};
pub use models::{
    Account, AccountId, Checkpoint, ExternalId, RawRecord, Record, RecordFailure, RunId,
    RunOutcome, StopReason, SyncRun,
};
pub use scheduler::{
    ActiveRunStatus, DispatchError, DrainReport, LastOutcome, Scheduler, SchedulerStatus,
    SchedulerTotals, TickReport,
};
pub use storage::{BatchCounts, InMemorySyncStore, SqliteSyncStore, SyncStore, UpsertAction};
pub use supervisor::{LifecycleState, ShutdownReport, StatusSnapshot, Supervisor, SupervisorError};
pub use sync::{
    // Run execution
    ApplyReport, CancelToken, ProgressHandle, RetryPolicy, RunProgress, SyncEngine, Upserter,
    // Completion events
    ChannelEventSink, CompletionEvent, EventSink, LogEventSink,
    // Scheduling decisions
    is_eligible, is_stale,
};
