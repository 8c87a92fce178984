//! SQLite-backed store.
//!
//! rusqlite is synchronous, so every call runs on the blocking pool against a
//! single shared connection.

use super::{LogEntry, SessionCounters, SessionRecord, SessionStatus, SessionStore};
use crate::shell::AuthMethod;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use termgate_core::{GateError, GateResult};
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS terminal_sessions (
    id TEXT PRIMARY KEY,
    device_id TEXT NOT NULL,
    name TEXT,
    auth_method TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    duration_secs INTEGER NOT NULL DEFAULT 0,
    command_count INTEGER NOT NULL DEFAULT 0,
    bytes_transmitted INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_terminal_sessions_device
    ON terminal_sessions(device_id, updated_at);
CREATE TABLE IF NOT EXISTS terminal_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    entry_type TEXT NOT NULL,
    content TEXT NOT NULL,
    seq INTEGER NOT NULL,
    is_input INTEGER NOT NULL,
    raw INTEGER NOT NULL,
    timestamp INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_terminal_logs_session ON terminal_logs(session_id, seq);
";

const SESSION_COLUMNS: &str = "id, device_id, name, auth_method, status, created_at, updated_at, \
     duration_secs, command_count, bytes_transmitted";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> GateResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(db_err)?;
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> GateResult<Self> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> GateResult<Self> {
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        debug!("session store schema ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<F, R>(&self, f: F) -> GateResult<R>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn).map_err(db_err)
        })
        .await
        .map_err(|e| GateError::Store(format!("store task failed: {e}")))?
    }

    /// Log entries of one session ordered by sequence.
    #[cfg(test)]
    pub async fn log_entries(&self, session_id: &str) -> GateResult<Vec<LogEntry>> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, entry_type, content, seq, is_input, raw, timestamp
                 FROM terminal_logs WHERE session_id = ?1 ORDER BY seq",
            )?;
            let rows = stmt.query_map(params![session_id], |row| {
                Ok(LogEntry {
                    session_id: row.get(0)?,
                    entry_type: row.get(1)?,
                    content: row.get(2)?,
                    seq: row.get::<_, i64>(3)? as u64,
                    is_input: row.get(4)?,
                    raw: row.get(5)?,
                    timestamp: from_millis(row.get(6)?),
                })
            })?;
            rows.collect()
        })
        .await
    }
}

fn db_err(e: rusqlite::Error) -> GateError {
    GateError::Store(e.to_string())
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn text_err(idx: usize, e: GateError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
    )
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let auth: String = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        device_id: row.get(1)?,
        name: row.get(2)?,
        auth_method: AuthMethod::parse(&auth).map_err(|e| text_err(3, e))?,
        status: SessionStatus::parse(&status).map_err(|e| text_err(4, e))?,
        created_at: from_millis(row.get(5)?),
        updated_at: from_millis(row.get(6)?),
        duration_secs: row.get::<_, i64>(7)? as u64,
        command_count: row.get::<_, i64>(8)? as u64,
        bytes_transmitted: row.get::<_, i64>(9)? as u64,
    })
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create_session_record(&self, record: &SessionRecord) -> GateResult<()> {
        let r = record.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO terminal_sessions
                 (id, device_id, name, auth_method, status, created_at, updated_at,
                  duration_secs, command_count, bytes_transmitted)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    r.id,
                    r.device_id,
                    r.name,
                    r.auth_method.as_str(),
                    r.status.as_str(),
                    r.created_at.timestamp_millis(),
                    r.updated_at.timestamp_millis(),
                    r.duration_secs as i64,
                    r.command_count as i64,
                    r.bytes_transmitted as i64,
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn update_session_status(&self, id: &str, status: SessionStatus) -> GateResult<()> {
        let id = id.to_string();
        let changed = self
            .run({
                let id = id.clone();
                move |conn| {
                    conn.execute(
                        "UPDATE terminal_sessions SET status = ?2, updated_at = ?3 WHERE id = ?1",
                        params![id, status.as_str(), Utc::now().timestamp_millis()],
                    )
                }
            })
            .await?;
        if changed == 0 {
            return Err(GateError::SessionNotFound(id));
        }
        Ok(())
    }

    async fn update_session_counters(
        &self,
        id: &str,
        counters: SessionCounters,
    ) -> GateResult<()> {
        let id = id.to_string();
        let changed = self
            .run({
                let id = id.clone();
                move |conn| {
                    conn.execute(
                        "UPDATE terminal_sessions
                         SET duration_secs = ?2, command_count = ?3, bytes_transmitted = ?4,
                             updated_at = ?5
                         WHERE id = ?1",
                        params![
                            id,
                            counters.duration_secs as i64,
                            counters.command_count as i64,
                            counters.bytes_transmitted as i64,
                            Utc::now().timestamp_millis(),
                        ],
                    )
                }
            })
            .await?;
        if changed == 0 {
            return Err(GateError::SessionNotFound(id));
        }
        Ok(())
    }

    async fn append_log_entry(&self, entry: &LogEntry) -> GateResult<()> {
        let e = entry.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO terminal_logs
                 (session_id, entry_type, content, seq, is_input, raw, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    e.session_id,
                    e.entry_type,
                    e.content,
                    e.seq as i64,
                    e.is_input,
                    e.raw,
                    e.timestamp.timestamp_millis(),
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn find_resumable_sessions(
        &self,
        device_id: &str,
        max_age: Duration,
    ) -> GateResult<Vec<SessionRecord>> {
        let device_id = device_id.to_string();
        let cutoff = Utc::now().timestamp_millis() - max_age.as_millis() as i64;
        self.run(move |conn| {
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM terminal_sessions
                 WHERE device_id = ?1 AND status != 'closed' AND updated_at >= ?2
                 ORDER BY updated_at DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![device_id, cutoff], session_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn find_session_by_id(&self, id: &str) -> GateResult<Option<SessionRecord>> {
        let id = id.to_string();
        self.run(move |conn| {
            let sql = format!("SELECT {SESSION_COLUMNS} FROM terminal_sessions WHERE id = ?1");
            conn.query_row(&sql, params![id], session_from_row).optional()
        })
        .await
    }
}
