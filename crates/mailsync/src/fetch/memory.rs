//! In-memory fetch client
//!
//! Serves pre-loaded pages and scripted failures. Cursors have the form
//! `page-N`, meaning the first N pages have been handed out.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{FetchClient, Page};
use crate::error::FetchError;
use crate::models::{Account, AccountId, RawRecord};

#[derive(Default)]
struct FetchState {
    pages: HashMap<AccountId, Vec<Vec<RawRecord>>>,
    failures: HashMap<AccountId, VecDeque<FetchError>>,
    requests: Vec<(AccountId, Option<String>)>,
}

#[derive(Default)]
pub struct InMemoryFetchClient {
    state: Mutex<FetchState>,
}

impl InMemoryFetchClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cursor returned after `pages_served` pages
    pub fn cursor_after(pages_served: usize) -> String {
        format!("page-{}", pages_served)
    }

    fn state(&self) -> MutexGuard<'_, FetchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the remote mailbox of an account
    pub fn set_pages(&self, account: &AccountId, pages: Vec<Vec<RawRecord>>) {
        self.state().pages.insert(account.clone(), pages);
    }

    /// Append one page to an account's mailbox
    pub fn push_page(&self, account: &AccountId, records: Vec<RawRecord>) {
        self.state()
            .pages
            .entry(account.clone())
            .or_default()
            .push(records);
    }

    /// Queue an error returned by the next fetch for this account
    pub fn fail_next(&self, account: &AccountId, error: FetchError) {
        self.state()
            .failures
            .entry(account.clone())
            .or_default()
            .push_back(error);
    }

    /// Cursors requested for an account, in order
    pub fn requested_cursors(&self, account: &AccountId) -> Vec<Option<String>> {
        self.state()
            .requests
            .iter()
            .filter(|(id, _)| id == account)
            .map(|(_, cursor)| cursor.clone())
            .collect()
    }

    fn parse_cursor(cursor: Option<&str>) -> Result<usize, FetchError> {
        match cursor {
            None => Ok(0),
            Some(c) => c
                .strip_prefix("page-")
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| FetchError::Protocol(format!("unknown cursor {}", c))),
        }
    }
}

impl FetchClient for InMemoryFetchClient {
    fn fetch_page(&self, account: &Account, cursor: Option<&str>) -> Result<Page, FetchError> {
        let mut state = self.state();
        state
            .requests
            .push((account.id.clone(), cursor.map(str::to_string)));

        if let Some(error) = state
            .failures
            .get_mut(&account.id)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        let pages = state
            .pages
            .get(&account.id)
            .ok_or_else(|| FetchError::NotFound(account.id.to_string()))?;
        let index = Self::parse_cursor(cursor)?;

        if index >= pages.len() {
            return Ok(Page {
                records: Vec::new(),
                next_cursor: cursor.map(str::to_string),
                has_more: false,
            });
        }

        Ok(Page {
            records: pages[index].clone(),
            next_cursor: Some(Self::cursor_after(index + 1)),
            has_more: index + 1 < pages.len(),
        })
    }
}
