//! SQLite-based sync storage with zstd-compressed record payloads

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use rusqlite_migration::{M, Migrations};
use serde_json::Value;

use super::{BatchCounts, SyncStore, UpsertAction};
use crate::error::SyncError;
use crate::models::{
    Account, AccountId, Checkpoint, ExternalId, Record, RecordFailure, RunId, RunOutcome,
    StopReason, SyncRun,
};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: accounts and records
        M::up(
            r#"
            CREATE TABLE accounts (
                id TEXT PRIMARY KEY,
                credential_ref TEXT NOT NULL,
                added_at TEXT NOT NULL,
                last_sync_at TEXT,
                last_sync_cursor TEXT,
                checkpoint_updated_at TEXT,
                suspended_at TEXT,
                suspension_reason TEXT
            );

            -- One row per remote message; payload is zstd-compressed JSON
            CREATE TABLE records (
                account_id TEXT NOT NULL,
                external_id TEXT NOT NULL,
                revision TEXT,
                payload BLOB NOT NULL,
                synced_at TEXT NOT NULL,
                PRIMARY KEY (account_id, external_id),
                FOREIGN KEY (account_id) REFERENCES accounts(id)
            );
            "#,
        ),
        // Migration 2: run history
        M::up(
            r#"
            CREATE TABLE sync_runs (
                run_id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                pages_fetched INTEGER NOT NULL DEFAULT 0,
                records_seen INTEGER NOT NULL DEFAULT 0,
                inserted INTEGER NOT NULL DEFAULT 0,
                updated INTEGER NOT NULL DEFAULT 0,
                unchanged INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                outcome TEXT,
                stop_reason TEXT,
                error TEXT,
                failures TEXT NOT NULL DEFAULT '[]'
            );

            CREATE INDEX idx_sync_runs_account_started
                ON sync_runs(account_id, started_at DESC);
            CREATE INDEX idx_sync_runs_started ON sync_runs(started_at);
            "#,
        ),
    ])
}

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in database: {}", s))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn encode_payload(payload: &Value) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(payload).context("Failed to serialize payload")?;
    // Level 3 = good balance of speed vs compression
    zstd::encode_all(json.as_slice(), 3).context("Failed to compress payload")
}

fn decode_payload(blob: &[u8]) -> Result<Value> {
    let json = zstd::decode_all(blob).context("Failed to decompress payload")?;
    serde_json::from_slice(&json).context("Failed to parse stored payload")
}

/// Raw account columns, converted outside the rusqlite closure
struct AccountRow {
    id: String,
    credential_ref: String,
    added_at: String,
    last_sync_at: Option<String>,
    last_sync_cursor: Option<String>,
    suspended_at: Option<String>,
    suspension_reason: Option<String>,
}

const ACCOUNT_COLUMNS: &str = "id, credential_ref, added_at, last_sync_at, last_sync_cursor, \
                               suspended_at, suspension_reason";

impl AccountRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            credential_ref: row.get(1)?,
            added_at: row.get(2)?,
            last_sync_at: row.get(3)?,
            last_sync_cursor: row.get(4)?,
            suspended_at: row.get(5)?,
            suspension_reason: row.get(6)?,
        })
    }

    fn into_account(self) -> Result<Account> {
        Ok(Account {
            id: AccountId(self.id),
            credential_ref: self.credential_ref,
            added_at: parse_ts(&self.added_at)?,
            last_sync_at: parse_opt_ts(self.last_sync_at)?,
            last_sync_cursor: self.last_sync_cursor,
            suspended_at: parse_opt_ts(self.suspended_at)?,
            suspension_reason: self.suspension_reason,
        })
    }
}

/// Raw sync_runs columns
struct RunRow {
    run_id: String,
    account_id: String,
    started_at: String,
    ended_at: Option<String>,
    counts: [i64; 6],
    outcome: Option<String>,
    stop_reason: Option<String>,
    error: Option<String>,
    failures: String,
}

const RUN_COLUMNS: &str = "run_id, account_id, started_at, ended_at, pages_fetched, records_seen, \
                           inserted, updated, unchanged, failed, outcome, stop_reason, error, failures";

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            account_id: row.get(1)?,
            started_at: row.get(2)?,
            ended_at: row.get(3)?,
            counts: [
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
                row.get(9)?,
            ],
            outcome: row.get(10)?,
            stop_reason: row.get(11)?,
            error: row.get(12)?,
            failures: row.get(13)?,
        })
    }

    fn into_run(self) -> Result<SyncRun> {
        let [pages_fetched, records_seen, inserted, updated, unchanged, failed] =
            self.counts.map(|n| n.max(0) as usize);

        let outcome = match self.outcome.as_deref() {
            Some(s) => Some(RunOutcome::parse(s).ok_or_else(|| anyhow!("Unknown outcome {}", s))?),
            None => None,
        };
        let stop_reason = match self.stop_reason.as_deref() {
            Some(s) => {
                Some(StopReason::parse(s).ok_or_else(|| anyhow!("Unknown stop reason {}", s))?)
            }
            None => None,
        };
        let error: Option<SyncError> = self
            .error
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse stored run error")?;
        let failures: Vec<RecordFailure> =
            serde_json::from_str(&self.failures).context("Failed to parse stored failures")?;

        Ok(SyncRun {
            run_id: RunId(self.run_id),
            account_id: AccountId(self.account_id),
            started_at: parse_ts(&self.started_at)?,
            ended_at: parse_opt_ts(self.ended_at)?,
            pages_fetched,
            records_seen,
            inserted,
            updated,
            unchanged,
            failed,
            outcome,
            stop_reason,
            error,
            failures,
        })
    }
}

/// SQLite-based sync storage
pub struct SqliteSyncStore {
    conn: Mutex<Connection>,
}

impl SqliteSyncStore {
    /// Open (or create) the database at `db_path` and run migrations
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;
        Self::configure(conn)
    }

    /// Private in-memory database, mostly for tests
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::configure(conn)
    }

    fn configure(mut conn: Connection) -> Result<Self> {
        // FULL: a returned set_checkpoint must survive power loss
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA cache_size = -16000;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))
    }

    /// Run an UPDATE on one account row, failing if the account is unknown
    fn update_account(&self, id: &AccountId, sql: &str, values: &[&dyn rusqlite::ToSql]) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(sql, values)?;
        if changed == 0 {
            bail!("unknown account {}", id);
        }
        Ok(())
    }
}

impl SyncStore for SqliteSyncStore {
    fn register_account(&self, account: Account) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO accounts
             (id, credential_ref, added_at, last_sync_at, last_sync_cursor,
              checkpoint_updated_at, suspended_at, suspension_reason)
             VALUES (?, ?, ?, ?, ?, ?, NULL, NULL)
             ON CONFLICT(id) DO UPDATE SET
                credential_ref = excluded.credential_ref,
                suspended_at = NULL,
                suspension_reason = NULL",
            params![
                account.id.as_str(),
                account.credential_ref,
                ts(account.added_at),
                account.last_sync_at.map(ts),
                account.last_sync_cursor,
                account.last_sync_cursor.as_ref().map(|_| ts(account.added_at)),
            ],
        )?;
        Ok(())
    }

    fn get_account(&self, id: &AccountId) -> Result<Option<Account>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM accounts WHERE id = ?", ACCOUNT_COLUMNS),
                [id.as_str()],
                AccountRow::from_row,
            )
            .optional()?;
        row.map(AccountRow::into_account).transpose()
    }

    fn list_accounts(&self) -> Result<Vec<Account>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM accounts ORDER BY id ASC",
            ACCOUNT_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], AccountRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(AccountRow::into_account).collect()
    }

    fn mark_synced(&self, id: &AccountId, at: DateTime<Utc>) -> Result<()> {
        self.update_account(
            id,
            "UPDATE accounts SET last_sync_at = ? WHERE id = ?",
            params![ts(at), id.as_str()],
        )
    }

    fn suspend_account(&self, id: &AccountId, reason: &str, at: DateTime<Utc>) -> Result<()> {
        self.update_account(
            id,
            "UPDATE accounts SET suspended_at = ?, suspension_reason = ? WHERE id = ?",
            params![ts(at), reason, id.as_str()],
        )
    }

    fn reinstate_account(&self, id: &AccountId) -> Result<bool> {
        let conn = self.conn()?;
        let suspended: Option<Option<String>> = conn
            .query_row(
                "SELECT suspended_at FROM accounts WHERE id = ?",
                [id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(suspended) = suspended else {
            bail!("unknown account {}", id);
        };

        conn.execute(
            "UPDATE accounts SET suspended_at = NULL, suspension_reason = NULL WHERE id = ?",
            [id.as_str()],
        )?;
        Ok(suspended.is_some())
    }

    fn get_checkpoint(&self, id: &AccountId) -> Result<Option<Checkpoint>> {
        let conn = self.conn()?;
        let row: Option<(Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT last_sync_cursor, checkpoint_updated_at FROM accounts WHERE id = ?",
                [id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((Some(cursor), updated_at)) = row else {
            return Ok(None);
        };
        let updated_at = parse_opt_ts(updated_at)?.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        Ok(Some(Checkpoint::new(id.clone(), cursor, updated_at)))
    }

    fn set_checkpoint(&self, id: &AccountId, cursor: &str, at: DateTime<Utc>) -> Result<()> {
        self.update_account(
            id,
            "UPDATE accounts SET last_sync_cursor = ?, checkpoint_updated_at = ? WHERE id = ?",
            params![cursor, ts(at), id.as_str()],
        )
    }

    fn apply_batch(&self, id: &AccountId, records: &[Record]) -> Result<BatchCounts> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut counts = BatchCounts::default();

        {
            let mut select = tx.prepare_cached(
                "SELECT revision, payload FROM records WHERE account_id = ? AND external_id = ?",
            )?;
            let mut insert = tx.prepare_cached(
                "INSERT INTO records (account_id, external_id, revision, payload, synced_at)
                 VALUES (?, ?, ?, ?, ?)",
            )?;
            let mut update = tx.prepare_cached(
                "UPDATE records SET revision = ?, payload = ?, synced_at = ?
                 WHERE account_id = ? AND external_id = ?",
            )?;

            for record in records {
                let existing: Option<(Option<String>, Vec<u8>)> = select
                    .query_row(params![id.as_str(), record.external_id.as_str()], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })
                    .optional()?;
                let existing = existing
                    .map(|(revision, blob)| decode_payload(&blob).map(|payload| (revision, payload)))
                    .transpose()
                    .with_context(|| format!("Corrupt stored record {}", record.external_id))?;

                let action = UpsertAction::decide(
                    existing.as_ref().map(|(rev, payload)| (rev.as_deref(), payload)),
                    record,
                );
                match action {
                    UpsertAction::Insert => {
                        insert.execute(params![
                            id.as_str(),
                            record.external_id.as_str(),
                            record.revision,
                            encode_payload(&record.payload)?,
                            ts(record.synced_at),
                        ])?;
                        counts.inserted += 1;
                    }
                    UpsertAction::Update => {
                        update.execute(params![
                            record.revision,
                            encode_payload(&record.payload)?,
                            ts(record.synced_at),
                            id.as_str(),
                            record.external_id.as_str(),
                        ])?;
                        counts.updated += 1;
                    }
                    UpsertAction::Unchanged => counts.unchanged += 1,
                }
            }
        }

        tx.commit().context("Failed to commit record batch")?;
        Ok(counts)
    }

    fn get_record(&self, id: &AccountId, external_id: &ExternalId) -> Result<Option<Record>> {
        let conn = self.conn()?;
        let row: Option<(Option<String>, Vec<u8>, String)> = conn
            .query_row(
                "SELECT revision, payload, synced_at FROM records
                 WHERE account_id = ? AND external_id = ?",
                params![id.as_str(), external_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((revision, blob, synced_at)) = row else {
            return Ok(None);
        };
        Ok(Some(Record {
            account_id: id.clone(),
            external_id: external_id.clone(),
            revision,
            payload: decode_payload(&blob)?,
            synced_at: parse_ts(&synced_at)?,
        }))
    }

    fn count_records(&self, id: &AccountId) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE account_id = ?",
            [id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn save_run(&self, run: &SyncRun) -> Result<()> {
        let error = run.error.as_ref().map(serde_json::to_string).transpose()?;
        let failures = serde_json::to_string(&run.failures)?;

        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO sync_runs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                RUN_COLUMNS
            ),
            params![
                run.run_id.as_str(),
                run.account_id.as_str(),
                ts(run.started_at),
                run.ended_at.map(ts),
                run.pages_fetched as i64,
                run.records_seen as i64,
                run.inserted as i64,
                run.updated as i64,
                run.unchanged as i64,
                run.failed as i64,
                run.outcome.map(|o| o.as_str()),
                run.stop_reason.map(|r| r.as_str()),
                error,
                failures,
            ],
        )?;
        Ok(())
    }

    fn list_runs(&self, id: &AccountId, limit: usize) -> Result<Vec<SyncRun>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sync_runs WHERE account_id = ? ORDER BY started_at DESC LIMIT ?",
            RUN_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![id.as_str(), limit as i64], RunRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RunRow::into_run).collect()
    }

    fn prune_runs(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM sync_runs WHERE started_at < ?", [ts(before)])?;
        Ok(deleted)
    }
}
