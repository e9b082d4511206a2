//! Staleness checks used by the scheduler
//!
//! Pure functions over account state and an explicit `now`, so they can be
//! tested without a clock.

use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;

use crate::models::Account;

/// Check if more than `threshold` has elapsed since the last sync.
///
/// # Arguments
/// * `last_sync_at` - End of the last drained run (None if never synced)
/// * `now` - Current time
/// * `threshold` - Staleness threshold; equality is not stale
pub fn is_stale(last_sync_at: Option<DateTime<Utc>>, now: DateTime<Utc>, threshold: Duration) -> bool {
    match last_sync_at {
        Some(last) => now - last > threshold,
        None => true,
    }
}

/// Whether the scheduler may dispatch a run for `account`
pub fn is_eligible(account: &Account, now: DateTime<Utc>, threshold: Duration) -> bool {
    !account.is_suspended() && is_stale(account.last_sync_at, now, threshold)
}

/// Dispatch order: never-synced first, then least recently synced
pub fn staleness_order(a: &Account, b: &Account) -> Ordering {
    match (a.last_sync_at, b.last_sync_at) {
        (None, None) => a.id.cmp(&b.id),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.id.cmp(&b.id)),
    }
}
