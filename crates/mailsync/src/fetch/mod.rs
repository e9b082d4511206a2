//! Remote mailbox access
//!
//! The provider API itself lives outside this crate. The engine only needs
//! sequential, cursor-based paging through [`FetchClient`].

mod memory;
mod spool;

pub use memory::InMemoryFetchClient;
pub use spool::SpoolFetchClient;

use crate::error::FetchError;
use crate::models::{Account, RawRecord};

/// One page of remote records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<RawRecord>,
    /// Position after this page; None when the provider has nothing to resume from
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Paginated access to one provider
///
/// Calls block; the engine runs each account on its own thread.
pub trait FetchClient: Send + Sync {
    /// Fetch the page that follows `cursor` (None = from the beginning)
    fn fetch_page(&self, account: &Account, cursor: Option<&str>) -> Result<Page, FetchError>;
}
