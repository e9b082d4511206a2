//! One execution of the sync engine for one account

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::AccountId;
use crate::error::SyncError;

/// Per-record failures kept on a run; the count in `failed` is not capped
pub const MAX_RECORDED_FAILURES: usize = 100;

/// Unique identifier of a run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Terminal status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    /// No record failed
    Succeeded,
    /// At least one record was rejected, the rest were applied
    Partial,
    /// Aborted by a page-level, credential or storage error
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::Partial => "partial",
            RunOutcome::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "succeeded" => Some(RunOutcome::Succeeded),
            "partial" => Some(RunOutcome::Partial),
            "failed" => Some(RunOutcome::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the page loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The provider reported no more pages
    Drained,
    /// Per-run page cap reached; the rest is left to a later run
    PageLimit,
    /// Run exceeded its maximum duration
    Timeout,
    /// Shutdown or an explicit stop request
    Cancelled,
    /// A run-ending error; see `SyncRun::error`
    Error,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Drained => "drained",
            StopReason::PageLimit => "page_limit",
            StopReason::Timeout => "timeout",
            StopReason::Cancelled => "cancelled",
            StopReason::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "drained" => Some(StopReason::Drained),
            "page_limit" => Some(StopReason::PageLimit),
            "timeout" => Some(StopReason::Timeout),
            "cancelled" => Some(StopReason::Cancelled),
            "error" => Some(StopReason::Error),
            _ => None,
        }
    }
}

/// A record rejected during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordFailure {
    /// 1-based page number within the run
    pub page: usize,
    /// 0-based position within that page
    pub position: usize,
    pub error: SyncError,
}

/// Progress and result of one sync execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub run_id: RunId,
    pub account_id: AccountId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub pages_fetched: usize,
    pub records_seen: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    /// None while the run is active
    pub outcome: Option<RunOutcome>,
    pub stop_reason: Option<StopReason>,
    pub error: Option<SyncError>,
    pub failures: Vec<RecordFailure>,
}

impl SyncRun {
    /// Create an active run
    pub fn start(account_id: AccountId, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: RunId::generate(),
            account_id,
            started_at,
            ended_at: None,
            pages_fetched: 0,
            records_seen: 0,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            failed: 0,
            outcome: None,
            stop_reason: None,
            error: None,
            failures: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }

    /// Account for one applied page
    pub fn record_page(
        &mut self,
        records_seen: usize,
        inserted: usize,
        updated: usize,
        unchanged: usize,
        failures: Vec<RecordFailure>,
    ) {
        debug_assert!(!self.is_terminal(), "terminal runs are immutable");
        self.pages_fetched += 1;
        self.records_seen += records_seen;
        self.inserted += inserted;
        self.updated += updated;
        self.unchanged += unchanged;
        self.failed += failures.len();

        let room = MAX_RECORDED_FAILURES.saturating_sub(self.failures.len());
        self.failures.extend(failures.into_iter().take(room));
    }

    /// Close the run after the page loop ended without a run-level error
    pub fn finish(mut self, ended_at: DateTime<Utc>, reason: StopReason) -> Self {
        debug_assert!(!self.is_terminal(), "terminal runs are immutable");
        self.ended_at = Some(ended_at);
        self.stop_reason = Some(reason);
        self.outcome = Some(if self.failed > 0 {
            RunOutcome::Partial
        } else {
            RunOutcome::Succeeded
        });
        self
    }

    /// Close the run with a run-ending error
    pub fn fail(mut self, ended_at: DateTime<Utc>, error: SyncError) -> Self {
        debug_assert!(!self.is_terminal(), "terminal runs are immutable");
        self.ended_at = Some(ended_at);
        self.stop_reason = Some(StopReason::Error);
        self.outcome = Some(RunOutcome::Failed);
        self.error = Some(error);
        self
    }

    /// The run stopped early by choice; a later run continues from the checkpoint
    pub fn more_pending(&self) -> bool {
        matches!(
            self.stop_reason,
            Some(StopReason::PageLimit | StopReason::Timeout | StopReason::Cancelled)
        )
    }

    /// Whether the remote stream was consumed to its end
    pub fn drained(&self) -> bool {
        self.stop_reason == Some(StopReason::Drained)
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(position: usize) -> RecordFailure {
        RecordFailure {
            page: 1,
            position,
            error: SyncError::validation(None, "missing external id"),
        }
    }

    #[test]
    fn test_finish_without_failures_succeeds() {
        let mut run = SyncRun::start(AccountId::new("a"), Utc::now());
        run.record_page(50, 50, 0, 0, vec![]);
        let run = run.finish(Utc::now(), StopReason::Drained);

        assert_eq!(run.outcome, Some(RunOutcome::Succeeded));
        assert!(run.drained());
        assert!(!run.more_pending());
        assert_eq!(run.pages_fetched, 1);
    }

    #[test]
    fn test_finish_with_failures_is_partial() {
        let mut run = SyncRun::start(AccountId::new("a"), Utc::now());
        run.record_page(3, 2, 0, 0, vec![failure(1)]);
        let run = run.finish(Utc::now(), StopReason::PageLimit);

        assert_eq!(run.outcome, Some(RunOutcome::Partial));
        assert_eq!(run.failed, 1);
        assert!(run.more_pending());
    }

    #[test]
    fn test_fail_keeps_error() {
        let run = SyncRun::start(AccountId::new("a"), Utc::now()).fail(
            Utc::now(),
            SyncError::PermanentFetch {
                message: "revoked".into(),
            },
        );
        assert_eq!(run.outcome, Some(RunOutcome::Failed));
        assert_eq!(run.stop_reason, Some(StopReason::Error));
        assert!(run.error.is_some());
        assert!(run.is_terminal());
    }

    #[test]
    fn test_recorded_failures_are_capped() {
        let mut run = SyncRun::start(AccountId::new("a"), Utc::now());
        let failures = (0..MAX_RECORDED_FAILURES + 20).map(failure).collect();
        run.record_page(MAX_RECORDED_FAILURES + 20, 0, 0, 0, failures);

        assert_eq!(run.failed, MAX_RECORDED_FAILURES + 20);
        assert_eq!(run.failures.len(), MAX_RECORDED_FAILURES);
    }

    #[test]
    fn test_outcome_round_trip_strings() {
        for outcome in [RunOutcome::Succeeded, RunOutcome::Partial, RunOutcome::Failed] {
            assert_eq!(RunOutcome::parse(outcome.as_str()), Some(outcome));
        }
        assert_eq!(StopReason::parse("page_limit"), Some(StopReason::PageLimit));
        assert_eq!(StopReason::parse("bogus"), None);
    }
}
