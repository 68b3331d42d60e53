use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use pacer_core::{BackoffPolicy, Clock, Payload, RecordId, RetryRecord, SessionId, WorkKind};
use pacer_storage::{KindAttemptCount, RetryStore, StorageError, StorageResult};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

const RECORD_COLUMNS: &str = "id, session_id, kind, payload_json, attempt_count, due_at, created_at";

/// SQLite-backed retry store scoped to one session.
///
/// Each handle owns its own connection; several handles (or processes) may
/// point at the same database file. Dequeue is a single `DELETE ... RETURNING`
/// statement, so the select-and-remove is atomic across connections.
pub struct SqliteRetryStore {
    db_path: PathBuf,
    session_id: SessionId,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
    conn: Mutex<Connection>,
}

/// Column values as stored, before kind and payload are decoded.
struct RawRecord {
    id: i64,
    session_id: String,
    kind: String,
    payload_json: String,
    attempt_count: i64,
    due_at: i64,
    created_at: i64,
}

impl RawRecord {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            session_id: r.get(1)?,
            kind: r.get(2)?,
            payload_json: r.get(3)?,
            attempt_count: r.get(4)?,
            due_at: r.get(5)?,
            created_at: r.get(6)?,
        })
    }

    fn decode(self) -> StorageResult<RetryRecord> {
        let corrupt = |reason: String| StorageError::Corrupt { id: self.id, reason };
        let kind = self.kind.parse::<WorkKind>().map_err(|e| corrupt(e.to_string()))?;
        let payload: Payload = serde_json::from_str(&self.payload_json).map_err(|e| corrupt(format!("payload: {e}")))?;
        let attempt_count = u32::try_from(self.attempt_count).map_err(|_| corrupt(format!("attempt_count {}", self.attempt_count)))?;
        Ok(RetryRecord {
            id: RecordId(self.id),
            session_id: SessionId::from_str(self.session_id),
            kind,
            payload,
            attempt_count,
            due_at_ms: self.due_at,
            created_at_ms: self.created_at,
        })
    }
}

impl SqliteRetryStore {
    pub fn open(db_path: &Path, session_id: SessionId, backoff: BackoffPolicy, clock: Arc<dyn Clock>) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path).with_context(|| format!("open sqlite db {}", db_path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |r| r.get(0))?;
        debug!(db = %db_path.display(), journal_mode = %mode, session = %session_id, "opened retry store");
        // init schema
        let init_sql = include_str!("../migrations/0001_init.sql");
        conn.execute_batch(init_sql).with_context(|| "migrate retry store schema")?;
        Ok(Self {
            db_path: db_path.to_path_buf(),
            session_id,
            backoff,
            clock,
            conn: Mutex::new(conn),
        })
    }

    /// Open another handle on the same database file for a different session.
    pub fn for_session(&self, session_id: SessionId) -> Result<Self> {
        Self::open(&self.db_path, session_id, self.backoff, self.clock.clone())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    fn select_next_ready(&self, conn: &Connection, now: i64, remove: bool) -> StorageResult<Option<RetryRecord>> {
        let sql = if remove {
            format!(
                "DELETE FROM retry_records
                 WHERE id = (SELECT id FROM retry_records
                             WHERE session_id = ?1 AND due_at <= ?2
                             ORDER BY due_at, id LIMIT 1)
                 RETURNING {RECORD_COLUMNS}"
            )
        } else {
            format!(
                "SELECT {RECORD_COLUMNS} FROM retry_records
                 WHERE session_id = ?1 AND due_at <= ?2
                 ORDER BY due_at, id LIMIT 1"
            )
        };
        let raw = conn
            .query_row(&sql, params![self.session_id.0, now], RawRecord::from_row)
            .optional()
            .map_err(StorageError::backend)?;
        raw.map(RawRecord::decode).transpose()
    }
}

impl RetryStore for SqliteRetryStore {
    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn enqueue(&self, kind: WorkKind, payload: Payload, attempt_count: u32) -> StorageResult<RetryRecord> {
        let now = self.clock.now_ms();
        let due_at = self.backoff.due_at_ms(now, attempt_count);
        let payload_json = serde_json::to_string(&payload)?;
        let conn = self.conn()?;
        let id: i64 = conn
            .query_row(
                "INSERT INTO retry_records(session_id, kind, payload_json, attempt_count, due_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 RETURNING id",
                params![self.session_id.0, kind.as_str(), payload_json, attempt_count as i64, due_at, now],
                |r| r.get(0),
            )
            .map_err(StorageError::backend)?;
        Ok(RetryRecord {
            id: RecordId(id),
            session_id: self.session_id.clone(),
            kind,
            payload,
            attempt_count,
            due_at_ms: due_at,
            created_at_ms: now,
        })
    }

    fn dequeue_next_ready(&self) -> StorageResult<Option<RetryRecord>> {
        let now = self.clock.now_ms();
        let conn = self.conn()?;
        // A row that fails to decode is still removed, otherwise it would pin the head of the queue.
        self.select_next_ready(&conn, now, true)
    }

    fn peek_next_ready(&self) -> StorageResult<Option<RetryRecord>> {
        let now = self.clock.now_ms();
        let conn = self.conn()?;
        self.select_next_ready(&conn, now, false)
    }

    fn count(&self) -> StorageResult<u64> {
        let conn = self.conn()?;
        let n: i64 = conn
            .query_row("SELECT COUNT(1) FROM retry_records WHERE session_id = ?1", params![self.session_id.0], |r| r.get(0))
            .map_err(StorageError::backend)?;
        Ok(n as u64)
    }

    fn count_ready(&self) -> StorageResult<u64> {
        let now = self.clock.now_ms();
        let conn = self.conn()?;
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(1) FROM retry_records WHERE session_id = ?1 AND due_at <= ?2",
                params![self.session_id.0, now],
                |r| r.get(0),
            )
            .map_err(StorageError::backend)?;
        Ok(n as u64)
    }

    fn clear(&self) -> StorageResult<u64> {
        let conn = self.conn()?;
        let removed = conn
            .execute("DELETE FROM retry_records WHERE session_id = ?1", params![self.session_id.0])
            .map_err(StorageError::backend)?;
        Ok(removed as u64)
    }

    fn stats_by_kind_and_attempts(&self) -> StorageResult<Vec<KindAttemptCount>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT kind, attempt_count, COUNT(1) FROM retry_records
                 WHERE session_id = ?1
                 GROUP BY kind, attempt_count",
            )
            .map_err(StorageError::backend)?;
        let rows = stmt
            .query_map(params![self.session_id.0], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?))
            })
            .map_err(StorageError::backend)?;

        let mut out = vec![];
        for row in rows {
            let (kind, attempt_count, count) = row.map_err(StorageError::backend)?;
            let kind = kind.parse::<WorkKind>().map_err(|e| StorageError::Corrupt { id: -1, reason: e.to_string() })?;
            out.push(KindAttemptCount {
                kind,
                attempt_count: attempt_count as u32,
                count: count as u64,
            });
        }
        // Enum order rather than the text order SQLite grouped by.
        out.sort_by_key(|s| (s.kind, s.attempt_count));
        Ok(out)
    }
}
