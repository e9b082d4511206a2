//! Error taxonomy for sync runs
//!
//! Every failure a run can observe falls into one of four kinds. Fetch
//! clients report [`FetchError`]; the engine maps it (and storage failures)
//! onto [`SyncError`], which is what gets recorded on a [`SyncRun`](crate::SyncRun).

use serde::{Deserialize, Serialize};

/// Failure reported by a [`FetchClient`](crate::fetch::FetchClient)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Credential rejected or revoked; needs re-authentication
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The remote mailbox does not exist (anymore)
    #[error("account not found: {0}")]
    NotFound(String),

    /// Timeout, rate limit or temporary provider outage
    #[error("transient fetch failure: {0}")]
    Transient(String),

    /// The provider answered with something we cannot interpret
    #[error("malformed page: {0}")]
    Protocol(String),
}

impl FetchError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }

    /// Whether the account must be suspended until externally remedied;
    /// true for every non-transient failure
    pub fn requires_remediation(&self) -> bool {
        !self.is_transient()
    }
}

/// The closed set of error kinds a run can end with (or record per record)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientFetch,
    PermanentFetch,
    Validation,
    StorageCommit,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientFetch => "transient_fetch",
            ErrorKind::PermanentFetch => "permanent_fetch",
            ErrorKind::Validation => "validation",
            ErrorKind::StorageCommit => "storage_commit",
        }
    }
}

/// A classified sync failure
///
/// Serialized with an internal `kind` tag so it can be persisted alongside
/// the run that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncError {
    /// Retries exhausted on a retryable fetch failure
    #[error("fetch failed after {attempts} attempts: {message}")]
    TransientFetch { attempts: u32, message: String },

    /// Non-retryable fetch failure
    #[error("permanent fetch failure: {message}")]
    PermanentFetch { message: String },

    /// A single record was rejected
    #[error("invalid record {}: {reason}", .external_id.as_deref().unwrap_or("<missing id>"))]
    Validation {
        external_id: Option<String>,
        reason: String,
    },

    /// Reading or writing local state failed
    #[error("storage failure: {message}")]
    StorageCommit { message: String },
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::TransientFetch { .. } => ErrorKind::TransientFetch,
            SyncError::PermanentFetch { .. } => ErrorKind::PermanentFetch,
            SyncError::Validation { .. } => ErrorKind::Validation,
            SyncError::StorageCommit { .. } => ErrorKind::StorageCommit,
        }
    }

    pub fn validation(external_id: Option<&str>, reason: impl Into<String>) -> Self {
        SyncError::Validation {
            external_id: external_id.map(str::to_string),
            reason: reason.into(),
        }
    }

    /// Wrap a storage error, keeping the whole `anyhow` context chain
    pub fn storage(err: &anyhow::Error) -> Self {
        SyncError::StorageCommit {
            message: format!("{:#}", err),
        }
    }

    /// Classify a fetch error that ended a run after `attempts` tries
    pub fn from_fetch(err: &FetchError, attempts: u32) -> Self {
        if err.is_transient() {
            SyncError::TransientFetch {
                attempts,
                message: err.to_string(),
            }
        } else {
            SyncError::PermanentFetch {
                message: err.to_string(),
            }
        }
    }
}
