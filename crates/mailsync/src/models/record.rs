//! Synchronized records (one remote message each)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::AccountId;

/// Provider-side identifier of a record, unique within an account
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalId(pub String);

impl ExternalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExternalId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A record exactly as the fetch client returned it, before validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// May be empty when the provider omitted it; validation rejects that
    #[serde(default)]
    pub external_id: String,
    /// Provider revision marker (history id, etag, ...)
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl RawRecord {
    pub fn new(external_id: impl Into<String>, payload: Value) -> Self {
        Self {
            external_id: external_id.into(),
            revision: None,
            payload,
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }
}

/// A validated record as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub account_id: AccountId,
    pub external_id: ExternalId,
    pub revision: Option<String>,
    /// Opaque content; subject/sender/body are not interpreted here
    pub payload: Value,
    pub synced_at: DateTime<Utc>,
}

impl Record {
    pub fn from_raw(account_id: &AccountId, raw: RawRecord, synced_at: DateTime<Utc>) -> Self {
        Self {
            account_id: account_id.clone(),
            external_id: ExternalId(raw.external_id),
            revision: raw.revision,
            payload: raw.payload,
            synced_at,
        }
    }
}
