//! Record validation and batch upsert
//!
//! Each page becomes one atomic batch. Records that fail validation are
//! left out of the batch and reported individually, so a single malformed
//! message never blocks the rest of the page.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::SyncError;
use crate::models::{AccountId, RawRecord, Record, RecordFailure};
use crate::storage::{BatchCounts, SyncStore};

/// Longest accepted external id, in bytes
pub const MAX_EXTERNAL_ID_LEN: usize = 512;

/// Result of applying one page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    pub inserted: usize,
    pub updated: usize,
    /// Includes earlier duplicates superseded within the same page
    pub unchanged: usize,
    pub failed: Vec<RecordFailure>,
}

impl ApplyReport {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.unchanged + self.failed.len()
    }
}

/// A page after validation, ready to commit
#[derive(Debug, Clone, Default)]
pub struct PreparedBatch {
    pub records: Vec<Record>,
    pub failed: Vec<RecordFailure>,
    /// Records dropped because a later one in the page had the same id
    pub superseded: usize,
}

impl PreparedBatch {
    /// Combine with the counts the store reported for `records`
    pub fn into_report(self, counts: BatchCounts) -> ApplyReport {
        ApplyReport {
            inserted: counts.inserted,
            updated: counts.updated,
            unchanged: counts.unchanged + self.superseded,
            failed: self.failed,
        }
    }
}

pub struct Upserter {
    store: Arc<dyn SyncStore>,
    required_fields: Vec<String>,
}

impl Upserter {
    pub fn new(store: Arc<dyn SyncStore>, required_fields: Vec<String>) -> Self {
        Self {
            store,
            required_fields,
        }
    }

    /// Check one raw record; returns the rejection reason
    fn check(&self, raw: &RawRecord) -> Option<String> {
        if raw.external_id.trim().is_empty() {
            return Some("missing external id".to_string());
        }
        if raw.external_id.len() > MAX_EXTERNAL_ID_LEN {
            return Some(format!(
                "external id longer than {} bytes",
                MAX_EXTERNAL_ID_LEN
            ));
        }
        let Some(fields) = raw.payload.as_object() else {
            return Some("payload is not a JSON object".to_string());
        };
        self.required_fields
            .iter()
            .find(|field| fields.get(field.as_str()).is_none_or(|v| v.is_null()))
            .map(|field| format!("missing required field '{}'", field))
    }

    /// Validate a page and collapse duplicate ids
    ///
    /// `page` is the 1-based page number used in failure reports. When an id
    /// appears more than once, the last occurrence wins.
    pub fn prepare(
        &self,
        account_id: &AccountId,
        page: usize,
        records: Vec<RawRecord>,
        synced_at: DateTime<Utc>,
    ) -> PreparedBatch {
        let mut batch = PreparedBatch::default();
        let mut seen: HashMap<String, usize> = HashMap::new();

        for (position, raw) in records.into_iter().enumerate() {
            if let Some(reason) = self.check(&raw) {
                let external_id = (!raw.external_id.is_empty()).then_some(raw.external_id.as_str());
                log::debug!(
                    "[{}] rejecting record {} of page {}: {}",
                    account_id,
                    position,
                    page,
                    reason
                );
                batch.failed.push(RecordFailure {
                    page,
                    position,
                    error: SyncError::validation(external_id, reason),
                });
                continue;
            }

            let record = Record::from_raw(account_id, raw, synced_at);
            match seen.get(record.external_id.as_str()) {
                Some(&index) => {
                    batch.records[index] = record;
                    batch.superseded += 1;
                }
                None => {
                    seen.insert(record.external_id.0.clone(), batch.records.len());
                    batch.records.push(record);
                }
            }
        }

        batch
    }

    /// Write a prepared batch as one transaction
    pub fn commit(&self, account_id: &AccountId, records: &[Record]) -> Result<BatchCounts> {
        if records.is_empty() {
            return Ok(BatchCounts::default());
        }
        self.store.apply_batch(account_id, records)
    }

    /// Validate and commit one page
    pub fn apply(
        &self,
        account_id: &AccountId,
        page: usize,
        records: Vec<RawRecord>,
        synced_at: DateTime<Utc>,
    ) -> Result<ApplyReport> {
        let batch = self.prepare(account_id, page, records, synced_at);
        let counts = self.commit(account_id, &batch.records)?;
        Ok(batch.into_report(counts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::{Account, ExternalId};
    use crate::storage::InMemorySyncStore;
    use serde_json::json;

    fn setup(required: &[&str]) -> (Arc<InMemorySyncStore>, Upserter, AccountId) {
        let store = Arc::new(InMemorySyncStore::new());
        let account = Account::new("a", "c");
        let id = account.id.clone();
        store.register_account(account).unwrap();
        let upserter = Upserter::new(
            store.clone(),
            required.iter().map(|f| f.to_string()).collect(),
        );
        (store, upserter, id)
    }

    #[test]
    fn test_insert_then_unchanged() {
        let (store, upserter, id) = setup(&[]);
        let page = vec![
            RawRecord::new("m1", json!({"subject": "a"})).with_revision("1"),
            RawRecord::new("m2", json!({"subject": "b"})).with_revision("1"),
        ];

        let first = upserter.apply(&id, 1, page.clone(), Utc::now()).unwrap();
        assert_eq!(first.inserted, 2);

        let second = upserter.apply(&id, 1, page, Utc::now()).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.unchanged, 2);
        assert_eq!(store.count_records(&id).unwrap(), 2);
    }

    #[test]
    fn test_new_revision_updates() {
        let (store, upserter, id) = setup(&[]);
        upserter
            .apply(&id, 1, vec![RawRecord::new("m1", json!({"v": 1})).with_revision("1")], Utc::now())
            .unwrap();
        let report = upserter
            .apply(&id, 1, vec![RawRecord::new("m1", json!({"v": 2})).with_revision("2")], Utc::now())
            .unwrap();

        assert_eq!(report.updated, 1);
        let stored = store.get_record(&id, &ExternalId::new("m1")).unwrap().unwrap();
        assert_eq!(stored.payload, json!({"v": 2}));
    }

    #[test]
    fn test_invalid_records_are_isolated() {
        let (store, upserter, id) = setup(&["subject"]);
        let page = vec![
            RawRecord::new("ok", json!({"subject": "hi"})),
            RawRecord::new("", json!({"subject": "hi"})),
            RawRecord::new("not-object", json!("text")),
            RawRecord::new("no-subject", json!({"from": "x"})),
            RawRecord::new("x".repeat(MAX_EXTERNAL_ID_LEN + 1), json!({"subject": "hi"})),
        ];

        let report = upserter.apply(&id, 3, page, Utc::now()).unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.failed.len(), 4);
        assert_eq!(report.total(), 5);

        let positions: Vec<_> = report.failed.iter().map(|f| f.position).collect();
        assert_eq!(positions, vec![1, 2, 3, 4]);
        assert!(report.failed.iter().all(|f| f.page == 3));
        assert!(report.failed.iter().all(|f| f.error.kind() == ErrorKind::Validation));
        assert!(report.failed[2].error.to_string().contains("subject"));
        assert_eq!(store.count_records(&id).unwrap(), 1);
    }

    #[test]
    fn test_duplicate_ids_last_wins() {
        let (store, upserter, id) = setup(&[]);
        let page = vec![
            RawRecord::new("m1", json!({"v": 1})),
            RawRecord::new("m2", json!({})),
            RawRecord::new("m1", json!({"v": 2})),
        ];

        let report = upserter.apply(&id, 1, page, Utc::now()).unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.unchanged, 1);

        let stored = store.get_record(&id, &ExternalId::new("m1")).unwrap().unwrap();
        assert_eq!(stored.payload, json!({"v": 2}));
    }

    #[test]
    fn test_commit_failure_writes_nothing() {
        let (store, upserter, id) = setup(&[]);
        store.fail_next_commits(1);

        let page = vec![RawRecord::new("m1", json!({}))];
        assert!(upserter.apply(&id, 1, page, Utc::now()).is_err());
        assert_eq!(store.count_records(&id).unwrap(), 0);
    }
}
