//! Background scheduler
//!
//! On every tick the scheduler lists accounts, picks the stale ones and
//! starts a run for each on its own thread, up to `max_concurrent_runs`.
//! Accounts that do not fit stay stale and are picked up by a later tick.
//!
//! At most one run per account is active. The active-run map is the only
//! source of truth for that and is only modified under its mutex, together
//! with the capacity check.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Instant;

use crate::config::SyncConfig;
use crate::models::{AccountId, RunId, RunOutcome, StopReason, SyncRun};
use crate::sync::{
    CancelToken, ProgressHandle, RunProgress, SyncEngine, is_eligible, staleness_order,
};

/// Old runs are pruned at most this often
const PRUNE_INTERVAL_SECS: i64 = 3600;

/// Why a manual trigger was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("scheduler is draining")]
    Draining,

    #[error("sync service is not running")]
    NotRunning,

    #[error("account {0} already has an active run")]
    AlreadyRunning(AccountId),

    #[error("all {0} run slots are busy")]
    AtCapacity(usize),

    #[error("unknown account {0}")]
    UnknownAccount(AccountId),

    #[error("account {0} is suspended")]
    Suspended(AccountId),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("failed to start run thread: {0}")]
    Spawn(String),
}

/// A run currently in flight
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveRunStatus {
    pub account_id: AccountId,
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub stop_requested: bool,
    /// Counters as of the last committed page
    #[serde(flatten)]
    pub progress: RunProgress,
}

/// Result of the most recent finished run of an account
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastOutcome {
    pub run_id: RunId,
    pub outcome: RunOutcome,
    pub stop_reason: Option<StopReason>,
    pub ended_at: Option<DateTime<Utc>>,
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
    pub error: Option<String>,
}

impl LastOutcome {
    fn from_run(run: &SyncRun) -> Self {
        Self {
            run_id: run.run_id.clone(),
            outcome: run.outcome.unwrap_or(RunOutcome::Failed),
            stop_reason: run.stop_reason,
            ended_at: run.ended_at,
            inserted: run.inserted,
            updated: run.updated,
            failed: run.failed,
            error: run.error.as_ref().map(ToString::to_string),
        }
    }
}

/// Counters over the scheduler's lifetime
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerTotals {
    pub started_at: Option<DateTime<Utc>>,
    pub ticks: u64,
    pub runs_dispatched: u64,
    pub runs_succeeded: u64,
    pub runs_partial: u64,
    pub runs_failed: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub runs_pruned: u64,
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Eligible accounts, in dispatch order
    pub eligible: Vec<AccountId>,
    pub dispatched: Vec<AccountId>,
    /// Eligible but a run is already active
    pub already_running: Vec<AccountId>,
    /// Eligible but no run slot was free
    pub deferred: Vec<AccountId>,
}

/// Result of a drain
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainReport {
    /// Runs that stopped within the grace period
    pub completed: usize,
    /// Accounts whose runs were still going when the grace period ended
    pub abandoned: Vec<AccountId>,
}

/// Scheduler state as seen from outside
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub draining: bool,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub active_runs: Vec<ActiveRunStatus>,
    pub last_outcomes: BTreeMap<AccountId, LastOutcome>,
    pub totals: SchedulerTotals,
}

struct ActiveRun {
    run_id: RunId,
    started_at: DateTime<Utc>,
    cancel: CancelToken,
    progress: ProgressHandle,
}

#[derive(Default)]
struct SchedulerState {
    active: HashMap<AccountId, ActiveRun>,
    draining: bool,
    last_tick_at: Option<DateTime<Utc>>,
    last_prune_at: Option<DateTime<Utc>>,
    last_outcomes: BTreeMap<AccountId, LastOutcome>,
    totals: SchedulerTotals,
}

struct Inner {
    engine: Arc<SyncEngine>,
    config: SyncConfig,
    state: Mutex<SchedulerState>,
    /// Signalled whenever a run leaves the active map
    run_finished: Condvar,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the active marker when a run thread ends, even by panic
struct ActiveGuard {
    inner: Arc<Inner>,
    account_id: AccountId,
    finished: Option<SyncRun>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        state.active.remove(&self.account_id);

        match self.finished.take() {
            Some(run) => {
                let totals = &mut state.totals;
                match run.outcome {
                    Some(RunOutcome::Succeeded) => totals.runs_succeeded += 1,
                    Some(RunOutcome::Partial) => totals.runs_partial += 1,
                    Some(RunOutcome::Failed) | None => totals.runs_failed += 1,
                }
                totals.records_inserted += run.inserted as u64;
                totals.records_updated += run.updated as u64;
                state
                    .last_outcomes
                    .insert(self.account_id.clone(), LastOutcome::from_run(&run));
            }
            None => {
                log::error!("[{}] sync run ended without a result", self.account_id);
                state.totals.runs_failed += 1;
            }
        }

        drop(state);
        self.inner.run_finished.notify_all();
    }
}

/// Dispatches sync runs; cheap to clone, clones share state
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(engine: Arc<SyncEngine>, config: SyncConfig) -> Self {
        let state = SchedulerState {
            totals: SchedulerTotals {
                started_at: Some(engine.clock().now()),
                ..SchedulerTotals::default()
            },
            ..SchedulerState::default()
        };

        Self {
            inner: Arc::new(Inner {
                engine,
                config,
                state: Mutex::new(state),
                run_finished: Condvar::new(),
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.inner.engine
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.engine.clock().now()
    }

    /// Dispatch runs for every eligible account that fits
    pub fn tick(&self) -> TickReport {
        let now = self.now();
        let mut report = TickReport::default();

        {
            let mut state = self.inner.lock();
            if state.draining {
                return report;
            }
            state.totals.ticks += 1;
            state.last_tick_at = Some(now);
        }

        let mut accounts = match self.inner.engine.store().list_accounts() {
            Ok(accounts) => accounts,
            Err(e) => {
                log::error!("Failed to list accounts: {:#}", e);
                return report;
            }
        };

        let threshold = self.inner.config.staleness_threshold();
        accounts.retain(|account| is_eligible(account, now, threshold));
        accounts.sort_by(staleness_order);
        report.eligible = accounts.iter().map(|a| a.id.clone()).collect();

        for account_id in &report.eligible {
            match self.dispatch(account_id) {
                Ok(_) => report.dispatched.push(account_id.clone()),
                Err(DispatchError::AlreadyRunning(_)) => {
                    report.already_running.push(account_id.clone())
                }
                Err(DispatchError::AtCapacity(_)) => report.deferred.push(account_id.clone()),
                Err(DispatchError::Draining) => break,
                Err(e) => log::error!("[{}] dispatch failed: {}", account_id, e),
            }
        }

        if !report.eligible.is_empty() {
            log::info!(
                "Tick: {} eligible, {} dispatched, {} already running, {} deferred",
                report.eligible.len(),
                report.dispatched.len(),
                report.already_running.len(),
                report.deferred.len()
            );
        }

        self.prune_history(now);
        report
    }

    /// Start a run for one account now, regardless of staleness
    pub fn trigger(&self, account_id: &AccountId) -> Result<RunId, DispatchError> {
        let account = self
            .inner
            .engine
            .store()
            .get_account(account_id)
            .map_err(|e| DispatchError::Storage(format!("{:#}", e)))?
            .ok_or_else(|| DispatchError::UnknownAccount(account_id.clone()))?;

        if account.is_suspended() {
            return Err(DispatchError::Suspended(account_id.clone()));
        }
        self.dispatch(account_id)
    }

    /// Claim a slot and the account marker, then start the run thread
    fn dispatch(&self, account_id: &AccountId) -> Result<RunId, DispatchError> {
        let run = SyncRun::start(account_id.clone(), self.now());
        let run_id = run.run_id.clone();
        let cancel = CancelToken::new();
        let progress = ProgressHandle::new();

        {
            let mut state = self.inner.lock();
            if state.draining {
                return Err(DispatchError::Draining);
            }
            if state.active.contains_key(account_id) {
                return Err(DispatchError::AlreadyRunning(account_id.clone()));
            }
            let limit = self.inner.config.max_concurrent_runs;
            if state.active.len() >= limit {
                return Err(DispatchError::AtCapacity(limit));
            }
            state.active.insert(
                account_id.clone(),
                ActiveRun {
                    run_id: run_id.clone(),
                    started_at: run.started_at,
                    cancel: cancel.clone(),
                    progress: progress.clone(),
                },
            );
            state.totals.runs_dispatched += 1;
        }

        let mut guard = ActiveGuard {
            inner: self.inner.clone(),
            account_id: account_id.clone(),
            finished: None,
        };
        let inner = self.inner.clone();

        let spawned = thread::Builder::new()
            .name(format!("sync-{}", account_id))
            .spawn(move || {
                let run = inner.engine.execute_tracked(run, &cancel, &progress);
                guard.finished = Some(run);
            });

        match spawned {
            Ok(_) => Ok(run_id),
            Err(e) => {
                // The closure (and with it the guard) was dropped, releasing the marker
                log::error!("[{}] failed to spawn run thread: {}", account_id, e);
                Err(DispatchError::Spawn(e.to_string()))
            }
        }
    }

    /// Ask an account's active run to stop at the next page boundary
    ///
    /// Returns whether a run was active.
    pub fn request_stop(&self, account_id: &AccountId) -> bool {
        let state = self.inner.lock();
        match state.active.get(account_id) {
            Some(active) => {
                log::info!("[{}] stop requested for run {}", account_id, active.run_id);
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, account_id: &AccountId) -> bool {
        self.inner.lock().active.contains_key(account_id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    /// Block until no run is active; returns false on timeout
    pub fn wait_idle(&self, timeout: std::time::Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.inner.lock();

        while !state.active.is_empty() {
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.inner
                        .run_finished
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .inner
                    .run_finished
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
        true
    }

    /// Stop dispatching, cancel in-flight runs and wait up to `grace`
    ///
    /// Runs still going after `grace` are abandoned: their threads keep
    /// running detached and stop at their next page boundary.
    pub fn drain(&self, grace: std::time::Duration) -> DrainReport {
        let in_flight = {
            let mut state = self.inner.lock();
            state.draining = true;
            for (account_id, active) in &state.active {
                log::info!("[{}] cancelling run {}", account_id, active.run_id);
                active.cancel.cancel();
            }
            state.active.len()
        };

        self.wait_idle(grace);

        let state = self.inner.lock();
        let mut abandoned: Vec<AccountId> = state.active.keys().cloned().collect();
        abandoned.sort();
        if !abandoned.is_empty() {
            log::warn!("Abandoning {} runs after grace period", abandoned.len());
        }

        DrainReport {
            completed: in_flight.saturating_sub(abandoned.len()),
            abandoned,
        }
    }

    /// Accept dispatches again after a drain
    pub fn resume(&self) {
        self.inner.lock().draining = false;
    }

    pub fn is_draining(&self) -> bool {
        self.inner.lock().draining
    }

    pub fn totals(&self) -> SchedulerTotals {
        self.inner.lock().totals.clone()
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = self.inner.lock();
        let mut active_runs: Vec<ActiveRunStatus> = state
            .active
            .iter()
            .map(|(account_id, active)| ActiveRunStatus {
                account_id: account_id.clone(),
                run_id: active.run_id.clone(),
                started_at: active.started_at,
                stop_requested: active.cancel.is_cancelled(),
                progress: active.progress.snapshot(),
            })
            .collect();
        active_runs.sort_by(|a, b| a.account_id.cmp(&b.account_id));

        SchedulerStatus {
            draining: state.draining,
            last_tick_at: state.last_tick_at,
            active_runs,
            last_outcomes: state.last_outcomes.clone(),
            totals: state.totals.clone(),
        }
    }

    /// Tick every `tick_interval` until `stop` is cancelled
    pub fn run_loop(&self, stop: &CancelToken) {
        log::info!(
            "Scheduler loop started (tick every {}s)",
            self.inner.config.tick_interval_secs
        );
        loop {
            if stop.is_cancelled() {
                break;
            }
            self.tick();
            if !stop.sleep(self.inner.config.tick_interval()) {
                break;
            }
        }
        log::info!("Scheduler loop stopped");
    }

    fn prune_history(&self, now: DateTime<Utc>) {
        let Some(retention) = self.inner.config.run_history_retention() else {
            return;
        };
        let Some(cutoff) = now.checked_sub_signed(retention) else {
            return;
        };

        {
            let mut state = self.inner.lock();
            if let Some(last) = state.last_prune_at
                && now - last < Duration::seconds(PRUNE_INTERVAL_SECS)
            {
                return;
            }
            state.last_prune_at = Some(now);
        }

        match self.inner.engine.store().prune_runs(cutoff) {
            Ok(0) => {}
            Ok(removed) => {
                log::info!("Pruned {} runs older than {} days", removed, retention.num_days());
                self.inner.lock().totals.runs_pruned += removed as u64;
            }
            Err(e) => log::warn!("Failed to prune run history: {:#}", e),
        }
    }
}
