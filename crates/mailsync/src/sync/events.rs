//! Completion events handed to downstream consumers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::Sender;
use std::sync::{Mutex, PoisonError};

use crate::models::{AccountId, RunId, RunOutcome, SyncRun};

/// Summary of a finished run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub account_id: AccountId,
    pub run_id: RunId,
    pub outcome: RunOutcome,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed_count: usize,
    pub pages_fetched: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl CompletionEvent {
    /// Build from a terminal run; None while the run is active
    pub fn from_run(run: &SyncRun) -> Option<Self> {
        Some(Self {
            account_id: run.account_id.clone(),
            run_id: run.run_id.clone(),
            outcome: run.outcome?,
            inserted: run.inserted,
            updated: run.updated,
            unchanged: run.unchanged,
            failed_count: run.failed,
            pages_fetched: run.pages_fetched,
            started_at: run.started_at,
            ended_at: run.ended_at?,
        })
    }
}

/// Receiver of completion events
///
/// Called on the run's thread; implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: CompletionEvent);
}

/// Writes events to the log
#[derive(Debug, Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, event: CompletionEvent) {
        log::info!(
            "[{}] run {} {}: {} inserted, {} updated, {} unchanged, {} failed in {} pages",
            event.account_id,
            event.run_id,
            event.outcome,
            event.inserted,
            event.updated,
            event.unchanged,
            event.failed_count,
            event.pages_fetched
        );
    }
}

/// Forwards events over an unbounded channel
///
/// A dropped receiver is not an error; events are discarded from then on.
pub struct ChannelEventSink {
    tx: Mutex<Sender<CompletionEvent>>,
}

impl ChannelEventSink {
    pub fn new(tx: Sender<CompletionEvent>) -> Self {
        Self { tx: Mutex::new(tx) }
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: CompletionEvent) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if tx.send(event).is_err() {
            log::debug!("completion event dropped: receiver gone");
        }
    }
}
