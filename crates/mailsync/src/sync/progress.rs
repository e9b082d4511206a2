//! Live counters of an in-flight run

use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};

use crate::models::SyncRun;

/// Counters of a run so far, updated after every committed page
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunProgress {
    pub pages_fetched: usize,
    pub records_seen: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl RunProgress {
    pub fn from_run(run: &SyncRun) -> Self {
        Self {
            pages_fetched: run.pages_fetched,
            records_seen: run.records_seen,
            inserted: run.inserted,
            updated: run.updated,
            unchanged: run.unchanged,
            failed: run.failed,
        }
    }
}

/// Shared between the run thread (writer) and status readers
#[derive(Debug, Clone, Default)]
pub struct ProgressHandle {
    inner: Arc<Mutex<RunProgress>>,
}

impl ProgressHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, run: &SyncRun) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = RunProgress::from_run(run);
    }

    pub fn snapshot(&self) -> RunProgress {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
