//! Single-account sync runs
//!
//! A run walks the remote stream page by page from the last checkpoint:
//!
//! 1. fetch the page after the current cursor (transient errors retried)
//! 2. validate and upsert it as one batch
//! 3. advance the checkpoint to the page's cursor
//!
//! The checkpoint is only written after its batch commits, so a crash in
//! between replays one page, which the upsert absorbs.
//!
//! The run row is saved when the run starts and again after every page, so
//! history shows in-flight runs (and runs cut short by a crash). Backoff
//! waits never extend past the run timeout.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::events::{CompletionEvent, EventSink};
use super::progress::ProgressHandle;
use super::retry::{RetryError, RetryPolicy};
use super::upsert::Upserter;
use super::CancelToken;
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::{FetchError, SyncError};
use crate::fetch::{FetchClient, Page};
use crate::models::{Account, AccountId, StopReason, SyncRun};
use crate::storage::SyncStore;

pub struct SyncEngine {
    store: Arc<dyn SyncStore>,
    fetcher: Arc<dyn FetchClient>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    upserter: Upserter,
    retry: RetryPolicy,
    max_pages: usize,
    run_timeout: chrono::Duration,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn SyncStore>,
        fetcher: Arc<dyn FetchClient>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            upserter: Upserter::new(store.clone(), config.required_fields.clone()),
            store,
            fetcher,
            sink,
            clock,
            retry: config.retry_policy(),
            max_pages: config.max_pages_per_run,
            run_timeout: config.run_timeout(),
        }
    }

    /// Replace the retry policy derived from the config
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run one account to completion without external cancellation
    pub fn run(&self, account_id: &AccountId) -> SyncRun {
        let run = SyncRun::start(account_id.clone(), self.clock.now());
        self.execute(run, &CancelToken::new())
    }

    /// Drive an active run to a terminal state
    ///
    /// Persists the run and emits exactly one completion event. Never
    /// returns an error: every failure ends up on the returned run.
    pub fn execute(&self, run: SyncRun, cancel: &CancelToken) -> SyncRun {
        self.execute_tracked(run, cancel, &ProgressHandle::new())
    }

    /// [`execute`](Self::execute), publishing counters to `progress` after every page
    pub fn execute_tracked(
        &self,
        run: SyncRun,
        cancel: &CancelToken,
        progress: &ProgressHandle,
    ) -> SyncRun {
        log::info!("[{}] sync run {} started", run.account_id, run.run_id);
        self.persist(&run);
        let run = self.drive(run, cancel, progress);
        progress.update(&run);

        match &run.error {
            Some(error) => log::warn!(
                "[{}] sync run {} failed after {} pages: {}",
                run.account_id,
                run.run_id,
                run.pages_fetched,
                error
            ),
            None => log::info!(
                "[{}] sync run {} {} ({}): {} pages, {} records",
                run.account_id,
                run.run_id,
                run.outcome.map(|o| o.as_str()).unwrap_or("unknown"),
                run.stop_reason.map(|r| r.as_str()).unwrap_or("unknown"),
                run.pages_fetched,
                run.records_seen
            ),
        }

        self.persist(&run);
        if let Some(event) = CompletionEvent::from_run(&run) {
            self.sink.emit(event);
        }
        run
    }

    fn drive(&self, mut run: SyncRun, cancel: &CancelToken, progress: &ProgressHandle) -> SyncRun {
        let account_id = run.account_id.clone();

        let account = match self.store.get_account(&account_id) {
            Ok(Some(account)) => account,
            Ok(None) => {
                let message = format!("unknown account {}", account_id);
                return run.fail(self.clock.now(), SyncError::PermanentFetch { message });
            }
            Err(e) => return run.fail(self.clock.now(), SyncError::storage(&e)),
        };

        if account.is_suspended() {
            let message = format!(
                "account suspended: {}",
                account.suspension_reason.as_deref().unwrap_or("no reason recorded")
            );
            return run.fail(self.clock.now(), SyncError::PermanentFetch { message });
        }

        let mut cursor = match self.store.get_checkpoint(&account_id) {
            Ok(checkpoint) => checkpoint.map(|c| c.cursor),
            Err(e) => return run.fail(self.clock.now(), SyncError::storage(&e)),
        };
        log::debug!("[{}] resuming from cursor {:?}", account_id, cursor);

        loop {
            if cancel.is_cancelled() {
                return run.finish(self.clock.now(), StopReason::Cancelled);
            }
            if run.pages_fetched >= self.max_pages {
                return run.finish(self.clock.now(), StopReason::PageLimit);
            }
            if self.clock.now() - run.started_at >= self.run_timeout {
                log::warn!("[{}] run {} hit its time limit", account_id, run.run_id);
                return run.finish(self.clock.now(), StopReason::Timeout);
            }

            let page = match self.fetch(&account, cursor.as_deref(), cancel, self.budget(&run)) {
                Ok(page) => page,
                Err(RetryError::Cancelled { .. }) => {
                    return run.finish(self.clock.now(), StopReason::Cancelled);
                }
                Err(RetryError::Exhausted { attempts, last }) => {
                    return run.fail(self.clock.now(), SyncError::from_fetch(&last, attempts));
                }
                Err(RetryError::Fatal { attempts, error }) => {
                    let now = self.clock.now();
                    if error.requires_remediation() {
                        self.suspend(&account_id, &error.to_string(), now);
                    }
                    return run.fail(now, SyncError::from_fetch(&error, attempts));
                }
            };

            let Page {
                records,
                next_cursor,
                has_more,
            } = page;
            let page_number = run.pages_fetched + 1;
            let seen = records.len();

            let batch = self
                .upserter
                .prepare(&account_id, page_number, records, self.clock.now());
            let counts = match self.retry.run_within(
                cancel,
                self.budget(&run),
                |_| self.upserter.commit(&account_id, &batch.records),
                |_| true,
            ) {
                Ok(counts) => counts,
                Err(RetryError::Cancelled { .. }) => {
                    return run.finish(self.clock.now(), StopReason::Cancelled);
                }
                Err(e) => {
                    let error = e.into_inner();
                    return run.fail(self.clock.now(), SyncError::storage(&error));
                }
            };

            let report = batch.into_report(counts);
            log::debug!(
                "[{}] page {}: {} inserted, {} updated, {} unchanged, {} failed",
                account_id,
                page_number,
                report.inserted,
                report.updated,
                report.unchanged,
                report.failed.len()
            );
            run.record_page(
                seen,
                report.inserted,
                report.updated,
                report.unchanged,
                report.failed,
            );

            progress.update(&run);

            let advanced = match next_cursor {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => {
                    if let Err(e) = self.checkpoint(&account_id, &next, cancel, self.budget(&run)) {
                        return run.fail(self.clock.now(), SyncError::storage(&e));
                    }
                    cursor = Some(next);
                    true
                }
                _ => false,
            };
            self.persist(&run);

            if !has_more {
                let ended_at = self.clock.now();
                if let Err(e) = self.store.mark_synced(&account_id, ended_at) {
                    return run.fail(ended_at, SyncError::storage(&e));
                }
                return run.finish(ended_at, StopReason::Drained);
            }

            if !advanced {
                let now = self.clock.now();
                let message = "provider reported more pages without advancing the cursor".to_string();
                self.suspend(&account_id, &message, now);
                return run.fail(now, SyncError::PermanentFetch { message });
            }
        }
    }

    fn fetch(
        &self,
        account: &Account,
        cursor: Option<&str>,
        cancel: &CancelToken,
        budget: Duration,
    ) -> Result<Page, RetryError<FetchError>> {
        self.retry.run_within(
            cancel,
            budget,
            |attempt| {
                let result = self.fetcher.fetch_page(account, cursor);
                if let Err(e) = &result {
                    log::warn!(
                        "[{}] fetch attempt {}/{} failed: {}",
                        account.id,
                        attempt,
                        self.retry.attempts,
                        e
                    );
                }
                result
            },
            FetchError::is_transient,
        )
    }

    fn checkpoint(
        &self,
        account_id: &AccountId,
        cursor: &str,
        cancel: &CancelToken,
        budget: Duration,
    ) -> anyhow::Result<()> {
        self.retry
            .run_within(
                cancel,
                budget,
                |_| self.store.set_checkpoint(account_id, cursor, self.clock.now()),
                |_| true,
            )
            .map_err(RetryError::into_inner)
    }

    /// Time left before the run hits its timeout
    fn budget(&self, run: &SyncRun) -> Duration {
        let elapsed = self.clock.now() - run.started_at;
        match self.run_timeout.checked_sub(&elapsed) {
            Some(left) => left.to_std().unwrap_or(Duration::ZERO),
            None => Duration::MAX,
        }
    }

    fn persist(&self, run: &SyncRun) {
        if let Err(e) = self.store.save_run(run) {
            log::error!("[{}] failed to save run {}: {:#}", run.account_id, run.run_id, e);
        }
    }

    fn suspend(&self, account_id: &AccountId, reason: &str, at: DateTime<Utc>) {
        log::error!("[{}] suspending account: {}", account_id, reason);
        if let Err(e) = self.store.suspend_account(account_id, reason, at) {
            log::error!("[{}] failed to suspend account: {:#}", account_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorKind;
    use crate::fetch::InMemoryFetchClient;
    use crate::models::{RawRecord, RunOutcome};
    use crate::storage::InMemorySyncStore;
    use crate::sync::events::ChannelEventSink;
    use serde_json::json;
    use std::sync::mpsc;

    struct Harness {
        store: Arc<InMemorySyncStore>,
        fetcher: Arc<InMemoryFetchClient>,
        clock: Arc<ManualClock>,
        events: mpsc::Receiver<CompletionEvent>,
        engine: SyncEngine,
        account: AccountId,
    }

    fn harness(config: SyncConfig) -> Harness {
        let store = Arc::new(InMemorySyncStore::new());
        let fetcher = Arc::new(InMemoryFetchClient::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (tx, events) = mpsc::channel();
        let account = AccountId::new("alice");
        store.register_account(Account::new("alice", "cred")).unwrap();

        let engine = SyncEngine::new(
            store.clone(),
            fetcher.clone(),
            Arc::new(ChannelEventSink::new(tx)),
            clock.clone(),
            &config,
        )
        .with_retry_policy(RetryPolicy::immediate(config.retry_attempts));

        Harness {
            store,
            fetcher,
            clock,
            events,
            engine,
            account,
        }
    }

    fn page(prefix: &str, n: usize) -> Vec<RawRecord> {
        (0..n)
            .map(|i| RawRecord::new(format!("{}-{}", prefix, i), json!({"n": i})))
            .collect()
    }

    #[test]
    fn test_drains_all_pages() {
        let h = harness(SyncConfig::default());
        h.fetcher
            .set_pages(&h.account, vec![page("a", 2), page("b", 3)]);

        let run = h.engine.run(&h.account);
        assert_eq!(run.outcome, Some(RunOutcome::Succeeded));
        assert!(run.drained());
        assert_eq!(run.inserted, 5);
        assert_eq!(run.pages_fetched, 2);

        let account = h.store.get_account(&h.account).unwrap().unwrap();
        assert_eq!(account.last_sync_at, run.ended_at);
        assert_eq!(account.last_sync_cursor.as_deref(), Some("page-2"));
        assert_eq!(h.events.try_iter().count(), 1);
    }

    #[test]
    fn test_page_cap_leaves_rest_for_next_run() {
        let h = harness(SyncConfig {
            max_pages_per_run: 1,
            ..SyncConfig::default()
        });
        h.fetcher
            .set_pages(&h.account, vec![page("a", 1), page("b", 1)]);

        let first = h.engine.run(&h.account);
        assert_eq!(first.stop_reason, Some(StopReason::PageLimit));
        assert!(first.more_pending());
        let account = h.store.get_account(&h.account).unwrap().unwrap();
        assert!(account.last_sync_at.is_none());

        let second = h.engine.run(&h.account);
        assert!(second.drained());
        assert_eq!(h.store.count_records(&h.account).unwrap(), 2);
    }

    #[test]
    fn test_transient_errors_retried() {
        let h = harness(SyncConfig::default());
        h.fetcher.set_pages(&h.account, vec![page("a", 1)]);
        h.fetcher
            .fail_next(&h.account, FetchError::Transient("503".into()));
        h.fetcher
            .fail_next(&h.account, FetchError::Transient("503".into()));

        let run = h.engine.run(&h.account);
        assert_eq!(run.outcome, Some(RunOutcome::Succeeded));
        assert_eq!(h.fetcher.requested_cursors(&h.account).len(), 3);
    }

    #[test]
    fn test_transient_exhaustion_fails_without_moving_cursor() {
        let h = harness(SyncConfig::default());
        h.fetcher
            .set_pages(&h.account, vec![page("a", 1), page("b", 1)]);
        h.store.set_checkpoint(&h.account, "page-1", Utc::now()).unwrap();
        for _ in 0..3 {
            h.fetcher
                .fail_next(&h.account, FetchError::Transient("timeout".into()));
        }

        let run = h.engine.run(&h.account);
        assert_eq!(run.outcome, Some(RunOutcome::Failed));
        assert_eq!(
            run.error,
            Some(SyncError::TransientFetch {
                attempts: 3,
                message: "transient fetch failure: timeout".into()
            })
        );
        let checkpoint = h.store.get_checkpoint(&h.account).unwrap().unwrap();
        assert_eq!(checkpoint.cursor, "page-1");
    }

    #[test]
    fn test_auth_error_suspends_account() {
        let h = harness(SyncConfig::default());
        h.fetcher.set_pages(&h.account, vec![page("a", 1)]);
        h.fetcher
            .fail_next(&h.account, FetchError::Auth("token revoked".into()));

        let run = h.engine.run(&h.account);
        assert_eq!(run.error.as_ref().map(SyncError::kind), Some(ErrorKind::PermanentFetch));
        assert_eq!(h.fetcher.requested_cursors(&h.account).len(), 1);

        let account = h.store.get_account(&h.account).unwrap().unwrap();
        assert!(account.is_suspended());

        // Suspended accounts are refused without touching the provider
        let again = h.engine.run(&h.account);
        assert_eq!(again.outcome, Some(RunOutcome::Failed));
        assert_eq!(h.fetcher.requested_cursors(&h.account).len(), 1);
    }

    #[test]
    fn test_protocol_error_suspends_account() {
        let h = harness(SyncConfig::default());
        h.fetcher.set_pages(&h.account, vec![page("a", 1)]);
        h.fetcher
            .fail_next(&h.account, FetchError::Protocol("bad json".into()));

        let run = h.engine.run(&h.account);
        assert_eq!(run.error.as_ref().map(SyncError::kind), Some(ErrorKind::PermanentFetch));
        let account = h.store.get_account(&h.account).unwrap().unwrap();
        assert!(account.is_suspended());
        assert_eq!(
            account.suspension_reason.as_deref(),
            Some("malformed page: bad json")
        );
    }

    /// Always claims more pages but never moves the cursor
    struct StuckFetchClient;

    impl FetchClient for StuckFetchClient {
        fn fetch_page(&self, _account: &Account, cursor: Option<&str>) -> Result<Page, FetchError> {
            Ok(Page {
                records: vec![RawRecord::new("m1", json!({}))],
                next_cursor: Some(cursor.unwrap_or("page-1").to_string()),
                has_more: true,
            })
        }
    }

    #[test]
    fn test_stuck_cursor_suspends_account() {
        let store = Arc::new(InMemorySyncStore::new());
        let id = AccountId::new("alice");
        store.register_account(Account::new("alice", "cred")).unwrap();
        let engine = SyncEngine::new(
            store.clone(),
            Arc::new(StuckFetchClient),
            Arc::new(crate::sync::LogEventSink),
            Arc::new(ManualClock::new(Utc::now())),
            &SyncConfig::default(),
        );

        let run = engine.run(&id);
        assert_eq!(run.error.as_ref().map(SyncError::kind), Some(ErrorKind::PermanentFetch));
        // First page advances from None to page-1, the second one repeats it
        assert_eq!(run.pages_fetched, 2);
        assert!(store.get_account(&id).unwrap().unwrap().is_suspended());
    }

    #[test]
    fn test_backoff_bounded_by_run_timeout() {
        let mut h = harness(SyncConfig {
            run_timeout_secs: 1,
            ..SyncConfig::default()
        });
        h.engine = h.engine.with_retry_policy(RetryPolicy {
            attempts: 5,
            base: std::time::Duration::from_secs(30),
            multiplier: 2.0,
            max: std::time::Duration::from_secs(60),
            jitter: std::time::Duration::ZERO,
        });
        h.fetcher.set_pages(&h.account, vec![page("a", 1)]);
        h.fetcher
            .fail_next(&h.account, FetchError::Transient("503".into()));

        let started = std::time::Instant::now();
        let run = h.engine.run(&h.account);

        assert!(started.elapsed() < std::time::Duration::from_secs(10));
        assert_eq!(run.outcome, Some(RunOutcome::Failed));
        assert_eq!(
            run.error,
            Some(SyncError::TransientFetch {
                attempts: 1,
                message: "transient fetch failure: 503".into()
            })
        );
        assert!(!h.store.get_account(&h.account).unwrap().unwrap().is_suspended());
    }

    #[test]
    fn test_progress_tracks_committed_pages() {
        let h = harness(SyncConfig::default());
        h.fetcher
            .set_pages(&h.account, vec![page("a", 2), page("b", 3)]);
        let progress = ProgressHandle::new();

        let run = h.engine.execute_tracked(
            SyncRun::start(h.account.clone(), h.clock.now()),
            &CancelToken::new(),
            &progress,
        );

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.pages_fetched, 2);
        assert_eq!(snapshot.inserted, 5);
        assert_eq!(snapshot, crate::sync::RunProgress::from_run(&run));
    }

    #[test]
    fn test_commit_failure_retried_then_fatal() {
        let h = harness(SyncConfig::default());
        h.fetcher.set_pages(&h.account, vec![page("a", 2)]);

        h.store.fail_next_commits(1);
        let run = h.engine.run(&h.account);
        assert_eq!(run.outcome, Some(RunOutcome::Succeeded));

        h.store.fail_next_commits(3);
        h.fetcher.push_page(&h.account, page("b", 1));
        let run = h.engine.run(&h.account);
        assert_eq!(run.error.as_ref().map(SyncError::kind), Some(ErrorKind::StorageCommit));
        let checkpoint = h.store.get_checkpoint(&h.account).unwrap().unwrap();
        assert_eq!(checkpoint.cursor, "page-1");
    }

    #[test]
    fn test_timeout_stops_between_pages() {
        let h = harness(SyncConfig {
            run_timeout_secs: 60,
            ..SyncConfig::default()
        });
        h.fetcher
            .set_pages(&h.account, vec![page("a", 1), page("b", 1)]);

        let run = SyncRun::start(h.account.clone(), h.clock.now());
        h.clock.advance(chrono::Duration::seconds(61));
        let run = h.engine.execute(run, &CancelToken::new());

        assert_eq!(run.stop_reason, Some(StopReason::Timeout));
        assert_eq!(run.pages_fetched, 0);
    }

    #[test]
    fn test_cancelled_before_first_page() {
        let h = harness(SyncConfig::default());
        h.fetcher.set_pages(&h.account, vec![page("a", 1)]);
        let cancel = CancelToken::new();
        cancel.cancel();

        let run = h
            .engine
            .execute(SyncRun::start(h.account.clone(), Utc::now()), &cancel);
        assert_eq!(run.stop_reason, Some(StopReason::Cancelled));
        assert!(h.fetcher.requested_cursors(&h.account).is_empty());
    }

    #[test]
    fn test_unknown_account_fails() {
        let h = harness(SyncConfig::default());
        let run = h.engine.run(&AccountId::new("ghost"));
        assert_eq!(run.outcome, Some(RunOutcome::Failed));
        assert_eq!(h.events.try_iter().count(), 1);
    }

    #[test]
    fn test_runs_are_persisted() {
        let h = harness(SyncConfig::default());
        h.fetcher.set_pages(&h.account, vec![page("a", 1)]);
        let run = h.engine.run(&h.account);

        let history = h.store.list_runs(&h.account, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].run_id, run.run_id);
    }
}
