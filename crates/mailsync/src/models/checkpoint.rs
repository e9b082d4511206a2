//! Resumable sync position per account

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AccountId;

/// Durable marker of the last cursor whose preceding batch was committed
///
/// Resuming from `cursor` never skips a record: every page before it has
/// already been applied to the record table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub account_id: AccountId,
    pub cursor: String,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(account_id: AccountId, cursor: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            account_id,
            cursor: cursor.into(),
            updated_at,
        }
    }
}
