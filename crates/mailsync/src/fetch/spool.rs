//! File-based fetch client reading exported mailbox pages
//!
//! Directory structure:
//! ```text
//! spool/
//!   alice@example.com/
//!     0001.json          # [{"external_id": "...", "revision": "...", "payload": {...}}, ...]
//!     0002.json.zst      # same, zstd-compressed
//!   bob@example.com/
//!     0001.json
//! ```
//!
//! Pages are served in file-name order. The cursor is the name of the last
//! page handed out, so new files sorting after it are picked up by the next
//! run.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::{FetchClient, Page};
use crate::error::FetchError;
use crate::models::{Account, RawRecord};

/// Accepts a bare array or `{"records": [...]}`
#[derive(Deserialize)]
#[serde(untagged)]
enum SpoolPage {
    List(Vec<RawRecord>),
    Wrapped { records: Vec<RawRecord> },
}

impl SpoolPage {
    fn into_records(self) -> Vec<RawRecord> {
        match self {
            SpoolPage::List(records) | SpoolPage::Wrapped { records } => records,
        }
    }
}

pub struct SpoolFetchClient {
    root: PathBuf,
}

impl SpoolFetchClient {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn account_dir(&self, account: &Account) -> Result<PathBuf, FetchError> {
        let id = account.id.as_str();
        if id.is_empty() || id.contains(['/', '\\']) || id == "." || id == ".." {
            return Err(FetchError::NotFound(format!("invalid account id {:?}", id)));
        }
        Ok(self.root.join(id))
    }

    /// Page file names for an account, sorted
    fn page_names(dir: &Path) -> Result<Vec<String>, FetchError> {
        let entries = fs::read_dir(dir)
            .map_err(|e| FetchError::Transient(format!("cannot list {}: {}", dir.display(), e)))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| FetchError::Transient(e.to_string()))?;
            if let Some(name) = entry.file_name().to_str()
                && (name.ends_with(".json") || name.ends_with(".json.zst"))
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn read_page(path: &Path) -> Result<Vec<RawRecord>, FetchError> {
        let bytes = fs::read(path)
            .map_err(|e| FetchError::Transient(format!("cannot read {}: {}", path.display(), e)))?;

        let json = if path.extension().is_some_and(|ext| ext == "zst") {
            zstd::decode_all(bytes.as_slice()).map_err(|e| {
                FetchError::Protocol(format!("cannot decompress {}: {}", path.display(), e))
            })?
        } else {
            bytes
        };

        let page: SpoolPage = serde_json::from_slice(&json)
            .map_err(|e| FetchError::Protocol(format!("{}: {}", path.display(), e)))?;
        Ok(page.into_records())
    }
}

impl FetchClient for SpoolFetchClient {
    fn fetch_page(&self, account: &Account, cursor: Option<&str>) -> Result<Page, FetchError> {
        let dir = self.account_dir(account)?;
        if !dir.is_dir() {
            return Err(FetchError::NotFound(format!(
                "no spool directory for {}",
                account.id
            )));
        }

        let names = Self::page_names(&dir)?;
        let next = match cursor {
            None => names.first(),
            Some(cursor) => names.iter().find(|name| name.as_str() > cursor),
        };

        let Some(name) = next else {
            return Ok(Page {
                records: Vec::new(),
                next_cursor: cursor.map(str::to_string),
                has_more: false,
            });
        };

        let records = Self::read_page(&dir.join(name))?;
        let has_more = names.iter().any(|other| other > name);

        Ok(Page {
            records,
            next_cursor: Some(name.clone()),
            has_more,
        })
    }
}
