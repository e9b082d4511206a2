//! Lifecycle control for the scheduler loop

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::models::{AccountId, RunId, SyncRun};
use crate::scheduler::{
    ActiveRunStatus, DispatchError, DrainReport, LastOutcome, Scheduler, SchedulerTotals,
};
use crate::sync::CancelToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Stopped,
    Running,
    /// Shutting down; waiting for in-flight runs
    Draining,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Running => "running",
            LifecycleState::Draining => "draining",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    #[error("cannot start while {0}")]
    NotStopped(LifecycleState),

    #[error("failed to start scheduler thread: {0}")]
    Spawn(String),
}

/// Point-in-time view of the service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub state: LifecycleState,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub active_runs: Vec<ActiveRunStatus>,
    pub last_outcomes: BTreeMap<AccountId, LastOutcome>,
    pub totals: SchedulerTotals,
}

/// Outcome of [`Supervisor::stop`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShutdownReport {
    /// False when the supervisor was not running
    pub was_running: bool,
    pub drain: DrainReport,
}

struct Lifecycle {
    state: LifecycleState,
    loop_stop: Option<CancelToken>,
    loop_thread: Option<JoinHandle<()>>,
}

/// Owns the scheduler loop thread
pub struct Supervisor {
    scheduler: Scheduler,
    lifecycle: Mutex<Lifecycle>,
}

impl Supervisor {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            lifecycle: Mutex::new(Lifecycle {
                state: LifecycleState::Stopped,
                loop_stop: None,
                loop_thread: None,
            }),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle().state
    }

    /// Start ticking; the first tick happens immediately
    pub fn start(&self) -> Result<(), SupervisorError> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state != LifecycleState::Stopped {
            return Err(SupervisorError::NotStopped(lifecycle.state));
        }

        self.scheduler.resume();
        let stop = CancelToken::new();
        let scheduler = self.scheduler.clone();
        let loop_stop = stop.clone();

        let handle = thread::Builder::new()
            .name("sync-scheduler".to_string())
            .spawn(move || scheduler.run_loop(&loop_stop))
            .map_err(|e| SupervisorError::Spawn(e.to_string()))?;

        lifecycle.state = LifecycleState::Running;
        lifecycle.loop_stop = Some(stop);
        lifecycle.loop_thread = Some(handle);
        log::info!("Sync service started");
        Ok(())
    }

    /// Stop ticking and drain in-flight runs within the shutdown grace period
    pub fn stop(&self) -> ShutdownReport {
        let (stop, handle) = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state != LifecycleState::Running {
                return ShutdownReport::default();
            }
            lifecycle.state = LifecycleState::Draining;
            (lifecycle.loop_stop.take(), lifecycle.loop_thread.take())
        };

        log::info!("Sync service stopping");
        if let Some(stop) = stop {
            stop.cancel();
        }
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            log::error!("Scheduler thread panicked");
        }

        let drain = self.scheduler.drain(self.scheduler.config().shutdown_grace());
        self.lifecycle().state = LifecycleState::Stopped;
        log::info!(
            "Sync service stopped ({} runs finished, {} abandoned)",
            drain.completed,
            drain.abandoned.len()
        );

        ShutdownReport {
            was_running: true,
            drain,
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        let state = self.state();
        let scheduler = self.scheduler.status();
        StatusSnapshot {
            state,
            last_tick_at: scheduler.last_tick_at,
            active_runs: scheduler.active_runs,
            last_outcomes: scheduler.last_outcomes,
            totals: scheduler.totals,
        }
    }

    /// Run one account now, outside the tick schedule
    pub fn trigger(&self, account_id: &AccountId) -> Result<RunId, DispatchError> {
        match self.state() {
            LifecycleState::Running => {}
            LifecycleState::Draining => return Err(DispatchError::Draining),
            LifecycleState::Stopped => return Err(DispatchError::NotRunning),
        }
        self.scheduler.trigger(account_id)
    }

    pub fn request_stop(&self, account_id: &AccountId) -> bool {
        self.scheduler.request_stop(account_id)
    }

    /// Clear a suspension so the account is scheduled again
    pub fn reinstate(&self, account_id: &AccountId) -> Result<bool> {
        let reinstated = self.scheduler.engine().store().reinstate_account(account_id)?;
        if reinstated {
            log::info!("[{}] account reinstated", account_id);
        }
        Ok(reinstated)
    }

    pub fn history(&self, account_id: &AccountId, limit: usize) -> Result<Vec<SyncRun>> {
        self.scheduler.engine().store().list_runs(account_id, limit)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if self.state() == LifecycleState::Running {
            self.stop();
        }
    }
}
