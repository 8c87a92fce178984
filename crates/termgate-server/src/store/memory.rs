//! In-process store, used when no database path is configured.

use super::{LogEntry, SessionCounters, SessionRecord, SessionStatus, SessionStore};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use termgate_core::{GateError, GateResult};

#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    logs: Mutex<Vec<LogEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log entries of one session in append order.
    #[cfg(test)]
    pub fn log_entries(&self, session_id: &str) -> Vec<LogEntry> {
        self.logs
            .lock()
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn record(&self, id: &str) -> Option<SessionRecord> {
        self.sessions.lock().get(id).cloned()
    }

    fn update<F>(&self, id: &str, f: F) -> GateResult<()>
    where
        F: FnOnce(&mut SessionRecord),
    {
        let mut sessions = self.sessions.lock();
        let record = sessions
            .get_mut(id)
            .ok_or_else(|| GateError::SessionNotFound(id.to_string()))?;
        f(record);
        record.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session_record(&self, record: &SessionRecord) -> GateResult<()> {
        self.sessions
            .lock()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update_session_status(&self, id: &str, status: SessionStatus) -> GateResult<()> {
        self.update(id, |r| r.status = status)
    }

    async fn update_session_counters(
        &self,
        id: &str,
        counters: SessionCounters,
    ) -> GateResult<()> {
        self.update(id, |r| {
            r.duration_secs = counters.duration_secs;
            r.command_count = counters.command_count;
            r.bytes_transmitted = counters.bytes_transmitted;
        })
    }

    async fn append_log_entry(&self, entry: &LogEntry) -> GateResult<()> {
        self.logs.lock().push(entry.clone());
        Ok(())
    }

    async fn find_resumable_sessions(
        &self,
        device_id: &str,
        max_age: Duration,
    ) -> GateResult<Vec<SessionRecord>> {
        let now = Utc::now();
        let mut found: Vec<SessionRecord> = self
            .sessions
            .lock()
            .values()
            .filter(|r| r.device_id == device_id && r.is_resumable(max_age, now))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(found)
    }

    async fn find_session_by_id(&self, id: &str) -> GateResult<Option<SessionRecord>> {
        Ok(self.record(id))
    }
}
