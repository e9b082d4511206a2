//! Storage trait definitions

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::models::{Account, AccountId, Checkpoint, ExternalId, Record, SyncRun};

/// Row counts from one atomically applied batch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchCounts {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// What a batch write does with one incoming record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Insert,
    Update,
    Unchanged,
}

impl UpsertAction {
    /// Decide against the stored `(revision, payload)`, if any
    ///
    /// A revision marker on the incoming record is authoritative: equal
    /// markers mean unchanged. Without one the payloads are compared, so
    /// re-applying the same data never writes.
    pub fn decide(existing: Option<(Option<&str>, &Value)>, incoming: &Record) -> Self {
        let Some((stored_revision, stored_payload)) = existing else {
            return UpsertAction::Insert;
        };

        let same = match incoming.revision.as_deref() {
            Some(revision) => stored_revision == Some(revision),
            None => stored_revision.is_none() && stored_payload == &incoming.payload,
        };

        if same {
            UpsertAction::Unchanged
        } else {
            UpsertAction::Update
        }
    }
}

/// Trait for sync state storage
///
/// Everything is partitioned by account; the scheduler guarantees a single
/// writer per account, so implementations only need per-call atomicity.
pub trait SyncStore: Send + Sync {
    // === Accounts ===

    /// Register an account, or refresh the credential of an existing one
    ///
    /// Re-registering counts as re-authentication and clears a suspension.
    /// Sync bookkeeping (cursor, last sync) of an existing account is kept.
    fn register_account(&self, account: Account) -> Result<()>;

    /// Get an account by ID
    fn get_account(&self, id: &AccountId) -> Result<Option<Account>>;

    /// List all accounts, ordered by ID
    fn list_accounts(&self) -> Result<Vec<Account>>;

    /// Record the end time of a run that drained the remote stream
    fn mark_synced(&self, id: &AccountId, at: DateTime<Utc>) -> Result<()>;

    /// Stop scheduling an account until it is reinstated
    fn suspend_account(&self, id: &AccountId, reason: &str, at: DateTime<Utc>) -> Result<()>;

    /// Clear a suspension; returns whether the account was suspended
    fn reinstate_account(&self, id: &AccountId) -> Result<bool>;

    // === Checkpoints ===

    /// Last committed cursor for an account
    fn get_checkpoint(&self, id: &AccountId) -> Result<Option<Checkpoint>>;

    /// Advance the cursor; durable when this returns
    ///
    /// Only call after the batch the cursor covers has been applied.
    fn set_checkpoint(&self, id: &AccountId, cursor: &str, at: DateTime<Utc>) -> Result<()>;

    // === Records ===

    /// Upsert a batch of validated records as one atomic unit
    ///
    /// Either every record of the batch is applied or none is.
    fn apply_batch(&self, id: &AccountId, records: &[Record]) -> Result<BatchCounts>;

    /// Get a single record
    fn get_record(&self, id: &AccountId, external_id: &ExternalId) -> Result<Option<Record>>;

    /// Count records stored for an account
    fn count_records(&self, id: &AccountId) -> Result<usize>;

    // === Run history ===

    /// Persist a terminal run (upsert by run id)
    fn save_run(&self, run: &SyncRun) -> Result<()>;

    /// Most recent runs for an account, newest first
    fn list_runs(&self, id: &AccountId, limit: usize) -> Result<Vec<SyncRun>>;

    /// Delete runs started before `before`; returns how many were removed
    fn prune_runs(&self, before: DateTime<Utc>) -> Result<usize>;
}
