//! Session persistence port.
//!
//! The registry never waits on the store for I/O-path writes; those go through
//! [`StoreWriter`]. Lookups used for resuming (`find_*`) are awaited directly.

pub mod memory;
pub mod sqlite;
pub mod writer;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use writer::StoreWriter;

use crate::shell::AuthMethod;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use termgate_core::{GateError, GateResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Disconnected,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> GateResult<Self> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "disconnected" => Ok(SessionStatus::Disconnected),
            "closed" => Ok(SessionStatus::Closed),
            other => Err(GateError::Store(format!("unknown session status `{other}`"))),
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted session metadata. Holds no credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub device_id: String,
    pub name: Option<String>,
    pub auth_method: AuthMethod,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    /// Last activity.
    pub updated_at: DateTime<Utc>,
    pub duration_secs: u64,
    pub command_count: u64,
    pub bytes_transmitted: u64,
}

impl SessionRecord {
    pub fn new(id: &str, device_id: &str, name: Option<String>, auth_method: AuthMethod) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            device_id: device_id.to_string(),
            name,
            auth_method,
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
            duration_secs: 0,
            command_count: 0,
            bytes_transmitted: 0,
        }
    }

    /// Not closed and active within `max_age`.
    pub fn is_resumable(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        if self.status == SessionStatus::Closed {
            return false;
        }
        let age = now.signed_duration_since(self.updated_at);
        age.num_milliseconds() <= max_age.as_millis() as i64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounters {
    pub duration_secs: u64,
    pub command_count: u64,
    pub bytes_transmitted: u64,
}

/// One line of session history: a captured frame or a submitted command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub session_id: String,
    pub entry_type: String,
    pub content: String,
    pub seq: u64,
    pub is_input: bool,
    /// Set for raw command lines, clear for emulator frames.
    pub raw: bool,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session_record(&self, record: &SessionRecord) -> GateResult<()>;

    async fn update_session_status(&self, id: &str, status: SessionStatus) -> GateResult<()>;

    async fn update_session_counters(&self, id: &str, counters: SessionCounters)
        -> GateResult<()>;

    async fn append_log_entry(&self, entry: &LogEntry) -> GateResult<()>;

    /// Resumable records for a device, most recently active first.
    async fn find_resumable_sessions(
        &self,
        device_id: &str,
        max_age: Duration,
    ) -> GateResult<Vec<SessionRecord>>;

    async fn find_session_by_id(&self, id: &str) -> GateResult<Option<SessionRecord>>;
}
