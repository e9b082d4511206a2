//! Account model representing a synchronized mailbox owner

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a mailbox account
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AccountId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A registered mailbox account
///
/// Accounts are registered externally (when the user authenticates). The sync
/// engine only touches the sync bookkeeping fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// Reference to the stored credential; never interpreted here
    pub credential_ref: String,
    /// When the account was registered
    pub added_at: DateTime<Utc>,
    /// End time of the last run that drained the remote stream
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Last checkpointed cursor (None = start from the beginning)
    pub last_sync_cursor: Option<String>,
    /// Set when a permanent fetch error requires re-authentication
    pub suspended_at: Option<DateTime<Utc>>,
    pub suspension_reason: Option<String>,
}

impl Account {
    /// Create a never-synced account
    pub fn new(id: impl Into<AccountId>, credential_ref: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            credential_ref: credential_ref.into(),
            added_at: Utc::now(),
            last_sync_at: None,
            last_sync_cursor: None,
            suspended_at: None,
            suspension_reason: None,
        }
    }

    /// Set the last sync time
    pub fn with_last_sync_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_sync_at = Some(at);
        self
    }

    /// Set the checkpointed cursor
    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.last_sync_cursor = Some(cursor.into());
        self
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_new() {
        let account = Account::new("alice@example.com", "cred-1");
        assert_eq!(account.id.as_str(), "alice@example.com");
        assert_eq!(account.credential_ref, "cred-1");
        assert!(account.last_sync_at.is_none());
        assert!(account.last_sync_cursor.is_none());
        assert!(!account.is_suspended());
    }

    #[test]
    fn test_account_builders() {
        let at = Utc::now();
        let account = Account::new("a", "c").with_last_sync_at(at).with_cursor("p3");
        assert_eq!(account.last_sync_at, Some(at));
        assert_eq!(account.last_sync_cursor.as_deref(), Some("p3"));
    }

    #[test]
    fn test_serialization() {
        let account = Account::new("a", "c").with_cursor("p1");
        let json = serde_json::to_string(&account).unwrap();
        let back: Account = serde_json::from_str(&json).unwrap();
        assert_eq!(account, back);
    }
}
