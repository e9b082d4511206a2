//! In-memory storage implementation
//!
//! Used by tests and for dry runs. All state lives behind one `RwLock`, which
//! makes every trait call atomic, including whole batches.

use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{BatchCounts, SyncStore, UpsertAction};
use crate::models::{Account, AccountId, Checkpoint, ExternalId, Record, SyncRun};

#[derive(Default)]
struct MemoryState {
    accounts: BTreeMap<AccountId, Account>,
    checkpoints: HashMap<AccountId, Checkpoint>,
    records: HashMap<(AccountId, ExternalId), Record>,
    runs: Vec<SyncRun>,
}

/// In-memory implementation of SyncStore
///
/// Supports injecting commit and checkpoint failures to exercise the
/// engine's crash-safety paths.
pub struct InMemorySyncStore {
    state: RwLock<MemoryState>,
    commit_faults: AtomicUsize,
    checkpoint_faults: AtomicUsize,
}

impl InMemorySyncStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            commit_faults: AtomicUsize::new(0),
            checkpoint_faults: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` batch commits fail without applying anything
    pub fn fail_next_commits(&self, n: usize) {
        self.commit_faults.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` checkpoint writes fail without persisting
    pub fn fail_next_checkpoints(&self, n: usize) {
        self.checkpoint_faults.store(n, Ordering::SeqCst);
    }

    fn take_fault(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

impl Default for InMemorySyncStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStore for InMemorySyncStore {
    fn register_account(&self, account: Account) -> Result<()> {
        let mut guard = self.write()?;
        let state = &mut *guard;
        match state.accounts.get_mut(&account.id) {
            Some(existing) => {
                existing.credential_ref = account.credential_ref;
                existing.suspended_at = None;
                existing.suspension_reason = None;
            }
            None => {
                if let Some(cursor) = &account.last_sync_cursor {
                    let checkpoint =
                        Checkpoint::new(account.id.clone(), cursor.clone(), account.added_at);
                    state.checkpoints.insert(account.id.clone(), checkpoint);
                }
                state.accounts.insert(account.id.clone(), account);
            }
        }
        Ok(())
    }

    fn get_account(&self, id: &AccountId) -> Result<Option<Account>> {
        Ok(self.read()?.accounts.get(id).cloned())
    }

    fn list_accounts(&self) -> Result<Vec<Account>> {
        Ok(self.read()?.accounts.values().cloned().collect())
    }

    fn mark_synced(&self, id: &AccountId, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.write()?;
        let account = state
            .accounts
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown account {}", id))?;
        account.last_sync_at = Some(at);
        Ok(())
    }

    fn suspend_account(&self, id: &AccountId, reason: &str, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.write()?;
        let account = state
            .accounts
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown account {}", id))?;
        account.suspended_at = Some(at);
        account.suspension_reason = Some(reason.to_string());
        Ok(())
    }

    fn reinstate_account(&self, id: &AccountId) -> Result<bool> {
        let mut state = self.write()?;
        let account = state
            .accounts
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown account {}", id))?;
        let was_suspended = account.suspended_at.take().is_some();
        account.suspension_reason = None;
        Ok(was_suspended)
    }

    fn get_checkpoint(&self, id: &AccountId) -> Result<Option<Checkpoint>> {
        Ok(self.read()?.checkpoints.get(id).cloned())
    }

    fn set_checkpoint(&self, id: &AccountId, cursor: &str, at: DateTime<Utc>) -> Result<()> {
        if Self::take_fault(&self.checkpoint_faults) {
            bail!("injected checkpoint failure for {}", id);
        }

        let mut guard = self.write()?;
        let state = &mut *guard;
        let account = state
            .accounts
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown account {}", id))?;
        account.last_sync_cursor = Some(cursor.to_string());
        state
            .checkpoints
            .insert(id.clone(), Checkpoint::new(id.clone(), cursor, at));
        Ok(())
    }

    fn apply_batch(&self, id: &AccountId, records: &[Record]) -> Result<BatchCounts> {
        if Self::take_fault(&self.commit_faults) {
            bail!("injected commit failure for {}", id);
        }

        let mut guard = self.write()?;
        let state = &mut *guard;
        if !state.accounts.contains_key(id) {
            bail!("unknown account {}", id);
        }

        // Decide everything first so the batch lands all at once
        let mut counts = BatchCounts::default();
        let mut writes = Vec::new();
        for record in records {
            let key = (id.clone(), record.external_id.clone());
            let existing = state
                .records
                .get(&key)
                .map(|r| (r.revision.as_deref(), &r.payload));
            match UpsertAction::decide(existing, record) {
                UpsertAction::Insert => counts.inserted += 1,
                UpsertAction::Update => counts.updated += 1,
                UpsertAction::Unchanged => {
                    counts.unchanged += 1;
                    continue;
                }
            }
            writes.push((key, record.clone()));
        }

        state.records.extend(writes);
        Ok(counts)
    }

    fn get_record(&self, id: &AccountId, external_id: &ExternalId) -> Result<Option<Record>> {
        let key = (id.clone(), external_id.clone());
        Ok(self.read()?.records.get(&key).cloned())
    }

    fn count_records(&self, id: &AccountId) -> Result<usize> {
        Ok(self
            .read()?
            .records
            .keys()
            .filter(|(account_id, _)| account_id == id)
            .count())
    }

    fn save_run(&self, run: &SyncRun) -> Result<()> {
        let mut guard = self.write()?;
        let state = &mut *guard;
        match state.runs.iter_mut().find(|r| r.run_id == run.run_id) {
            Some(existing) => *existing = run.clone(),
            None => state.runs.push(run.clone()),
        }
        Ok(())
    }

    fn list_runs(&self, id: &AccountId, limit: usize) -> Result<Vec<SyncRun>> {
        let state = self.read()?;
        let mut runs: Vec<SyncRun> = state
            .runs
            .iter()
            .filter(|r| &r.account_id == id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    fn prune_runs(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut state = self.write()?;
        let len = state.runs.len();
        state.runs.retain(|r| r.started_at >= before);
        Ok(len - state.runs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StopReason;
    use chrono::Duration;
    use serde_json::json;

    fn make_record(account: &str, id: &str, revision: &str) -> Record {
        Record {
            account_id: AccountId::new(account),
            external_id: ExternalId::new(id),
            revision: Some(revision.to_string()),
            payload: json!({ "subject": format!("Subject {}", id) }),
            synced_at: Utc::now(),
        }
    }

    fn store_with_account(id: &str) -> InMemorySyncStore {
        let store = InMemorySyncStore::new();
        store.register_account(Account::new(id, "cred")).unwrap();
        store
    }

    #[test]
    fn test_apply_batch_counts() {
        let store = store_with_account("a");
        let account = AccountId::new("a");

        let batch = vec![make_record("a", "m1", "1"), make_record("a", "m2", "1")];
        let counts = store.apply_batch(&account, &batch).unwrap();
        assert_eq!(counts.inserted, 2);

        let batch = vec![make_record("a", "m1", "1"), make_record("a", "m2", "2")];
        let counts = store.apply_batch(&account, &batch).unwrap();
        assert_eq!(counts, BatchCounts { inserted: 0, updated: 1, unchanged: 1 });
        assert_eq!(store.count_records(&account).unwrap(), 2);
    }

    #[test]
    fn test_injected_commit_failure_applies_nothing() {
        let store = store_with_account("a");
        let account = AccountId::new("a");
        store.fail_next_commits(1);

        let batch = vec![make_record("a", "m1", "1")];
        assert!(store.apply_batch(&account, &batch).is_err());
        assert_eq!(store.count_records(&account).unwrap(), 0);

        // Fault is consumed
        assert!(store.apply_batch(&account, &batch).is_ok());
    }

    #[test]
    fn test_checkpoint_updates_account_cursor() {
        let store = store_with_account("a");
        let account = AccountId::new("a");
        assert!(store.get_checkpoint(&account).unwrap().is_none());

        store.set_checkpoint(&account, "p2", Utc::now()).unwrap();
        assert_eq!(store.get_checkpoint(&account).unwrap().unwrap().cursor, "p2");
        assert_eq!(
            store.get_account(&account).unwrap().unwrap().last_sync_cursor.as_deref(),
            Some("p2")
        );
    }

    #[test]
    fn test_reregister_clears_suspension_keeps_cursor() {
        let store = store_with_account("a");
        let account = AccountId::new("a");
        store.set_checkpoint(&account, "p2", Utc::now()).unwrap();
        store.suspend_account(&account, "revoked", Utc::now()).unwrap();

        store.register_account(Account::new("a", "cred-2")).unwrap();
        let loaded = store.get_account(&account).unwrap().unwrap();
        assert!(!loaded.is_suspended());
        assert_eq!(loaded.credential_ref, "cred-2");
        assert_eq!(loaded.last_sync_cursor.as_deref(), Some("p2"));
    }

    #[test]
    fn test_runs_listed_newest_first_and_pruned() {
        let store = store_with_account("a");
        let account = AccountId::new("a");
        let now = Utc::now();

        for age_days in [40, 10, 1] {
            let run = SyncRun::start(account.clone(), now - Duration::days(age_days))
                .finish(now, StopReason::Drained);
            store.save_run(&run).unwrap();
        }

        let runs = store.list_runs(&account, 2).unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs[0].started_at > runs[1].started_at);

        let pruned = store.prune_runs(now - Duration::days(30)).unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(store.list_runs(&account, 10).unwrap().len(), 2);
    }
}
