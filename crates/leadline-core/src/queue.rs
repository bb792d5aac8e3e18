//! Durable local queue of mutations waiting to reach the remote store.
//!
//! Backed by a single SQLite file so pending writes survive restarts. Every
//! method is synchronous and holds the connection lock only for the duration
//! of its statements. Status transitions are crate-private: the sync engine is
//! the only component allowed to move a mutation between states.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::models::{MutationKind, MutationStatus, Payload, PendingMutation, ReminderTask};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS mutations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    next_attempt_at TEXT,
    claimed_by TEXT,
    claimed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_mutations_order ON mutations (status, created_at, seq);
CREATE TABLE IF NOT EXISTS id_map (
    local_id TEXT PRIMARY KEY,
    remote_id TEXT NOT NULL,
    mapped_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS reminder_cache (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    body TEXT NOT NULL,
    fetched_at TEXT NOT NULL
);
";

const SELECT_COLUMNS: &str =
    "id, kind, payload, created_at, status, attempts, last_error, next_attempt_at";

/// Default cap on unsynced rows
pub const DEFAULT_MAX_LEN: usize = 10_000;

pub struct MutationQueue {
    conn: Mutex<Connection>,
    max_len: usize,
    /// Identifies this handle in `claimed_by`
    owner: String,
}

fn timestamp(at: DateTime<Utc>) -> String {
    // Fixed precision keeps lexical order equal to chronological order
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::Storage(format!("invalid timestamp '{value}': {e}")))
}

struct RawRow {
    id: String,
    kind: String,
    payload: String,
    created_at: String,
    status: String,
    attempts: u32,
    last_error: Option<String>,
    next_attempt_at: Option<String>,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            payload: row.get(2)?,
            created_at: row.get(3)?,
            status: row.get(4)?,
            attempts: row.get(5)?,
            last_error: row.get(6)?,
            next_attempt_at: row.get(7)?,
        })
    }

    fn into_mutation(self) -> Result<PendingMutation> {
        let kind = MutationKind::parse(&self.kind)
            .ok_or_else(|| SyncError::Storage(format!("unknown mutation kind '{}'", self.kind)))?;
        let status = MutationStatus::parse(&self.status)
            .ok_or_else(|| SyncError::Storage(format!("unknown status '{}'", self.status)))?;
        let payload: Payload = serde_json::from_str(&self.payload)?;
        Ok(PendingMutation {
            id: self.id,
            kind,
            payload,
            created_at: parse_timestamp(&self.created_at)?,
            status,
            attempts: self.attempts,
            last_error: self.last_error,
            next_attempt_at: self
                .next_attempt_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
        })
    }
}

impl MutationQueue {
    /// Open (or create) the queue database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SyncError::Storage(format!(
                    "Failed to create queue directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        let queue = Self::init(conn)?;
        info!("Mutation queue opened at {}", path.display());
        Ok(queue)
    }

    /// Queue that lives only as long as the process; used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_len: DEFAULT_MAX_LEN,
            owner: Uuid::new_v4().to_string(),
        })
    }

    /// Cap the number of unsynced mutations; `enqueue` reports `QuotaExceeded` beyond it.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Storage("queue lock poisoned".into()))
    }

    /// Record a mutation locally and return its local id.
    pub fn enqueue(&self, kind: MutationKind, payload: Payload) -> Result<String> {
        let conn = self.conn()?;
        let unsynced: i64 = conn.query_row(
            "SELECT COUNT(*) FROM mutations WHERE status != 'synced'",
            [],
            |row| row.get(0),
        )?;
        if unsynced as usize >= self.max_len {
            return Err(SyncError::QuotaExceeded(format!(
                "{unsynced} unsynced mutations (limit {})",
                self.max_len
            )));
        }

        let id = Uuid::new_v4().to_string();
        let body = serde_json::to_string(&payload)?;
        conn.execute(
            "INSERT INTO mutations (id, kind, payload, created_at, status, attempts)
             VALUES (?1, ?2, ?3, ?4, 'pending', 0)",
            params![id, kind.as_str(), body, timestamp(Utc::now())],
        )?;
        debug!("Queued {kind} as {id}");
        Ok(id)
    }

    /// Mutations in drain order, optionally restricted to one status.
    pub fn list(&self, filter: Option<MutationStatus>) -> Result<Vec<PendingMutation>> {
        let conn = self.conn()?;
        let raw = match filter {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SELECT_COLUMNS} FROM mutations WHERE status = ?1 ORDER BY created_at, seq"
                ))?;
                let rows = stmt
                    .query_map(params![status.as_str()], RawRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SELECT_COLUMNS} FROM mutations ORDER BY created_at, seq"
                ))?;
                let rows = stmt
                    .query_map([], RawRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        drop(conn);
        raw.into_iter().map(RawRow::into_mutation).collect()
    }

    pub fn get(&self, id: &str) -> Result<Option<PendingMutation>> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM mutations WHERE id = ?1"),
                params![id],
                RawRow::from_row,
            )
            .optional()?;
        drop(conn);
        raw.map(RawRow::into_mutation).transpose()
    }

    pub fn count(&self, filter: Option<MutationStatus>) -> Result<usize> {
        let conn = self.conn()?;
        let n: i64 = match filter {
            Some(status) => conn.query_row(
                "SELECT COUNT(*) FROM mutations WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM mutations", [], |row| row.get(0))?,
        };
        Ok(n as usize)
    }

    /// Claim a pending mutation for an attempt. Returns false if it was not pending,
    /// which is what keeps a mutation from being submitted twice concurrently,
    /// also across processes sharing the database file.
    pub(crate) fn mark_syncing(&self, id: &str) -> Result<bool> {
        let changed = self.conn()?.execute(
            "UPDATE mutations SET status = 'syncing', claimed_by = ?2, claimed_at = ?3
             WHERE id = ?1 AND status = 'pending'",
            params![id, self.owner, timestamp(Utc::now())],
        )?;
        Ok(changed == 1)
    }

    pub(crate) fn mark_synced(&self, id: &str) -> Result<()> {
        self.conn()?.execute(
            "UPDATE mutations SET status = 'synced', last_error = NULL, next_attempt_at = NULL,
                 claimed_by = NULL, claimed_at = NULL
             WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Terminal failure; the mutation waits for manual resolution.
    pub(crate) fn mark_failed(&self, id: &str, reason: &str) -> Result<()> {
        self.conn()?.execute(
            "UPDATE mutations SET status = 'failed', attempts = attempts + 1,
                 last_error = ?2, next_attempt_at = NULL, claimed_by = NULL, claimed_at = NULL
             WHERE id = ?1",
            params![id, reason],
        )?;
        Ok(())
    }

    /// Count a failed attempt and put the mutation back in line.
    pub(crate) fn mark_retry(
        &self,
        id: &str,
        reason: &str,
        not_before: DateTime<Utc>,
    ) -> Result<()> {
        self.conn()?.execute(
            "UPDATE mutations SET status = 'pending', attempts = attempts + 1,
                 last_error = ?2, next_attempt_at = ?3, claimed_by = NULL, claimed_at = NULL
             WHERE id = ?1",
            params![id, reason, timestamp(not_before)],
        )?;
        Ok(())
    }

    /// Return a claimed mutation to pending without counting an attempt.
    pub(crate) fn release(&self, id: &str, reason: Option<&str>) -> Result<()> {
        self.conn()?.execute(
            "UPDATE mutations SET status = 'pending', last_error = COALESCE(?2, last_error),
                 claimed_by = NULL, claimed_at = NULL
             WHERE id = ?1 AND status = 'syncing'",
            params![id, reason],
        )?;
        Ok(())
    }

    /// Move a failed mutation back to pending with a fresh attempt budget.
    pub(crate) fn reset_failed(&self, id: &str) -> Result<bool> {
        let changed = self.conn()?.execute(
            "UPDATE mutations SET status = 'pending', attempts = 0, last_error = NULL,
                 next_attempt_at = NULL
             WHERE id = ?1 AND status = 'failed'",
            params![id],
        )?;
        Ok(changed == 1)
    }

    pub(crate) fn remove(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn()?
            .execute("DELETE FROM mutations WHERE id = ?1", params![id])?;
        Ok(changed == 1)
    }

    /// Claims held by another handle for longer than `stale_after` go back to
    /// pending. Claims of this handle are never touched: its own attempts
    /// always settle or release them.
    pub(crate) fn recover_in_flight(&self, stale_after: Duration) -> Result<usize> {
        let stale_after = chrono::Duration::from_std(stale_after)
            .map_err(|e| SyncError::Storage(format!("invalid claim timeout: {e}")))?;
        let cutoff = timestamp(Utc::now() - stale_after);
        let changed = self.conn()?.execute(
            "UPDATE mutations SET status = 'pending', claimed_by = NULL, claimed_at = NULL
             WHERE status = 'syncing'
               AND (claimed_by IS NULL OR claimed_by != ?1)
               AND (claimed_at IS NULL OR claimed_at <= ?2)",
            params![self.owner, cutoff],
        )?;
        Ok(changed)
    }

    pub(crate) fn record_mapping(&self, local_id: &str, remote_id: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO id_map (local_id, remote_id, mapped_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(local_id) DO UPDATE SET remote_id = excluded.remote_id",
            params![local_id, remote_id, timestamp(Utc::now())],
        )?;
        Ok(())
    }

    /// Remote id assigned to an entity that was created under `local_id`.
    pub fn resolve_id(&self, local_id: &str) -> Result<Option<String>> {
        let remote = self
            .conn()?
            .query_row(
                "SELECT remote_id FROM id_map WHERE local_id = ?1",
                params![local_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(remote)
    }

    /// Replace the cached reminder set for `user_id`.
    pub fn cache_reminders(&self, user_id: &str, tasks: &[ReminderTask]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM reminder_cache WHERE user_id = ?1",
            params![user_id],
        )?;
        let fetched_at = timestamp(Utc::now());
        for task in tasks {
            tx.execute(
                "INSERT OR REPLACE INTO reminder_cache (id, user_id, body, fetched_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![task.id, user_id, serde_json::to_string(task)?, fetched_at],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn cached_reminders(&self, user_id: &str) -> Result<Vec<ReminderTask>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT body FROM reminder_cache WHERE user_id = ?1")?;
        let bodies = stmt
            .query_map(params![user_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(SyncError::from))
            .collect()
    }
}
