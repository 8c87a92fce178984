//! Session lifecycle management.
//!
//! Owns every live terminal session and mediates all transitions: create,
//! attach, detach, destroy, restore from the store, and the inactivity sweep.
//! Each session gets one pump task that consumes shell events in order.

use super::{ClientHandle, SessionParams, TerminalSession};
use crate::config::SessionSettings;
use crate::device::{DeviceCredentials, DeviceDirectory, KeyDecryptor};
use crate::shell::{ShellConnector, ShellEvent, ShellTarget};
use crate::store::{SessionCounters, SessionRecord, SessionStatus, SessionStore, StoreWriter};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use termgate_core::{ClientMessage, GateError, GateResult, ServerMessage};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Collaborators the registry talks to.
#[derive(Clone)]
pub struct RegistryPorts {
    pub connector: Arc<dyn ShellConnector>,
    pub decryptor: Arc<dyn KeyDecryptor>,
    pub devices: Arc<dyn DeviceDirectory>,
    pub store: Arc<dyn SessionStore>,
    pub writer: StoreWriter,
}

/// Snapshot returned by [`SessionRegistry::list`].
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub device_id: String,
    pub name: Option<String>,
    pub status: SessionStatus,
    pub attached: bool,
    pub idle_secs: u64,
    pub command_count: u64,
    pub bytes_transmitted: u64,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<TerminalSession>>>,
    /// Ids whose shell is being opened but not yet registered.
    opening: Mutex<HashSet<String>>,
    ports: RegistryPorts,
    settings: SessionSettings,
}

/// Claim on a session id while its shell opens. Released on drop.
struct Reservation<'a> {
    opening: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.opening.lock().remove(&self.id);
    }
}

impl SessionRegistry {
    pub fn new(ports: RegistryPorts, settings: SessionSettings) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            opening: Mutex::new(HashSet::new()),
            ports,
            settings,
        })
    }

    pub fn devices(&self) -> &Arc<dyn DeviceDirectory> {
        &self.ports.devices
    }

    pub async fn session(&self, id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Claim `id` unless it is live or already opening.
    async fn reserve(&self, id: &str) -> Option<Reservation<'_>> {
        let sessions = self.sessions.read().await;
        let mut opening = self.opening.lock();
        if sessions.contains_key(id) || !opening.insert(id.to_string()) {
            return None;
        }
        Some(Reservation {
            opening: &self.opening,
            id: id.to_string(),
        })
    }

    /// Open a new shell and register it under `id`, bound to `client`.
    pub async fn create_session(
        self: &Arc<Self>,
        id: &str,
        device_id: &str,
        name: Option<String>,
        creds: &DeviceCredentials,
        client: ClientHandle,
    ) -> GateResult<Arc<TerminalSession>> {
        let Some(_reservation) = self.reserve(id).await else {
            return Err(GateError::Other(format!("session {id} already exists")));
        };
        let session = self.open(id, device_id, name, creds, client, None).await?;
        info!(session_id = %id, device_id, auth = session.auth_method.as_str(), "session created");
        Ok(session)
    }

    /// Connect and register. The caller holds the reservation for `id`.
    async fn open(
        self: &Arc<Self>,
        id: &str,
        device_id: &str,
        name: Option<String>,
        creds: &DeviceCredentials,
        client: ClientHandle,
        existing: Option<SessionRecord>,
    ) -> GateResult<Arc<TerminalSession>> {
        let target = ShellTarget::resolve(creds, self.ports.decryptor.as_ref())?;
        let auth_method = target.auth.method();
        let bound = self.settings.connect_timeout;
        let open = self
            .ports
            .connector
            .open(target, self.settings.cols, self.settings.rows);
        let handle = tokio::time::timeout(bound, open)
            .await
            .map_err(|_| GateError::ConnectTimeout(bound))??;

        let (created_at, carried) = match &existing {
            Some(r) => (
                r.created_at,
                SessionCounters {
                    duration_secs: r.duration_secs,
                    command_count: r.command_count,
                    bytes_transmitted: r.bytes_transmitted,
                },
            ),
            None => (Utc::now(), SessionCounters::default()),
        };
        let session = Arc::new(TerminalSession::new(
            SessionParams {
                id: id.to_string(),
                device_id: device_id.to_string(),
                name: name.clone(),
                auth_method,
                created_at,
                carried,
                client: client.clone(),
            },
            handle.input,
            &self.settings,
        ));

        self.sessions
            .write()
            .await
            .insert(id.to_string(), session.clone());

        match existing {
            Some(_) => self.ports.writer.status(id, SessionStatus::Active),
            None => self.ports.writer.create(SessionRecord {
                created_at,
                ..SessionRecord::new(id, device_id, name, auth_method)
            }),
        }

        tokio::spawn(pump(Arc::downgrade(self), session.clone(), handle.events));
        client.send(ServerMessage::Connect {
            message: format!("connected to {}@{}", creds.username, creds.host),
        });
        Ok(session)
    }

    /// Bind `client` to a live session, replacing any previous client.
    /// Returns false if the session is unknown or its shell is gone.
    pub async fn attach_client(&self, id: &str, client: ClientHandle) -> bool {
        let Some(session) = self.session(id).await else {
            return false;
        };
        if !session.is_alive() || session.status() == SessionStatus::Closed {
            return false;
        }
        let conn_id = client.conn_id;
        if let Some(old) = session.bind(client) {
            if old.conn_id != conn_id {
                old.send(ServerMessage::close("session attached from another connection"));
            }
        }
        self.ports.writer.status(id, SessionStatus::Active);
        info!(session_id = %id, conn_id, "client attached");
        true
    }

    /// Drop the client binding; the shell keeps running.
    pub async fn detach_client(&self, id: &str) {
        if let Some(session) = self.session(id).await {
            if session.unbind() {
                self.after_detach(&session);
            }
        }
    }

    /// Detach only if `conn_id` is still the bound connection.
    pub async fn detach_if_bound(&self, id: &str, conn_id: u64) -> bool {
        match self.session(id).await {
            Some(session) if session.unbind_if(conn_id) => {
                self.after_detach(&session);
                true
            }
            _ => false,
        }
    }

    fn after_detach(&self, session: &TerminalSession) {
        self.ports.writer.counters(&session.id, session.counters());
        self.ports
            .writer
            .status(&session.id, SessionStatus::Disconnected);
        info!(session_id = %session.id, "client detached");
    }

    /// Close the shell, tell the client, and forget the session.
    pub async fn destroy_session(&self, id: &str, reason: &str) {
        let removed = self.sessions.write().await.remove(id);
        if let Some(session) = removed {
            self.finish(&session, reason);
        }
    }

    /// Like `destroy_session`, but only if `id` still maps to `session`.
    async fn destroy_exact(&self, session: &Arc<TerminalSession>, reason: &str) {
        let removed = {
            let mut sessions = self.sessions.write().await;
            let same = sessions
                .get(&session.id)
                .is_some_and(|current| Arc::ptr_eq(current, session));
            if same {
                sessions.remove(&session.id)
            } else {
                None
            }
        };
        if let Some(session) = removed {
            self.finish(&session, reason);
        }
    }

    fn finish(&self, session: &TerminalSession, reason: &str) {
        session.close(reason);
        self.ports.writer.counters(&session.id, session.counters());
        self.ports.writer.status(&session.id, SessionStatus::Closed);
        info!(session_id = %session.id, reason, "session destroyed");
    }

    /// Reopen a shell for a stored session under the same id. Only identity
    /// and counters survive; history starts empty.
    ///
    /// `Ok(false)` means the record is missing, closed, too old, or its device
    /// is unknown. Connect failures are errors.
    pub async fn restore_from_store(
        self: &Arc<Self>,
        id: &str,
        client: ClientHandle,
    ) -> GateResult<bool> {
        let Some(_reservation) = self.reserve(id).await else {
            // live, or another restore of the same id is connecting
            return Ok(self.attach_client(id, client).await);
        };
        let record = match self.ports.store.find_session_by_id(id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(false),
            Err(e) => {
                warn!(session_id = %id, error = %e, "store lookup failed");
                return Ok(false);
            }
        };
        if !record.is_resumable(self.settings.retention, Utc::now()) {
            debug!(session_id = %id, status = %record.status, "stored session not resumable");
            return Ok(false);
        }
        let Some(device) = self.ports.devices.device(&record.device_id) else {
            return Ok(false);
        };

        let name = record.name.clone();
        let device_id = record.device_id.clone();
        self.open(id, &device_id, name, &device.credentials, client, Some(record))
            .await?;
        info!(session_id = %id, device_id = %device_id, "session restored from store");
        Ok(true)
    }

    /// Resumable store records for a device that are not live right now.
    pub async fn stored_candidates(&self, device_id: &str) -> Vec<SessionRecord> {
        let records = match self
            .ports
            .store
            .find_resumable_sessions(device_id, self.settings.retention)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!(device_id, error = %e, "store lookup failed");
                return Vec::new();
            }
        };
        let live = self.sessions.read().await;
        records
            .into_iter()
            .filter(|r| !live.contains_key(&r.id))
            .collect()
    }

    /// Apply a terminal message from the client bound to `id`.
    pub async fn handle_client_message(&self, id: &str, message: &ClientMessage) -> GateResult<()> {
        let session = self
            .session(id)
            .await
            .ok_or_else(|| GateError::SessionNotFound(id.to_string()))?;
        match message {
            ClientMessage::TerminalData { data } => {
                let entries = session.ingest_input(data);
                if !entries.is_empty() {
                    for entry in entries {
                        self.ports.writer.log(entry);
                    }
                    self.ports.writer.counters(id, session.counters());
                }
                Ok(())
            }
            ClientMessage::TerminalResize { cols, rows } => {
                if *cols == 0 || *rows == 0 {
                    return Err(GateError::InvalidMessage(format!(
                        "invalid terminal size {cols}x{rows}"
                    )));
                }
                session.resize(*cols, *rows);
                debug!(session_id = %id, cols, rows, "terminal resized");
                Ok(())
            }
            ClientMessage::TerminalDisconnect => {
                self.detach_client(id).await;
                Ok(())
            }
            ClientMessage::TerminalTerminate => {
                self.destroy_session(id, "terminated by user").await;
                Ok(())
            }
            other => Err(GateError::InvalidMessage(format!(
                "`{}` is not a terminal message",
                other.kind()
            ))),
        }
    }

    /// Live sessions for a device, most recently active first.
    pub async fn resumable_for_device(&self, device_id: &str) -> Vec<Arc<TerminalSession>> {
        let mut found: Vec<Arc<TerminalSession>> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| {
                s.device_id == device_id && s.is_alive() && s.status() != SessionStatus::Closed
            })
            .cloned()
            .collect();
        found.sort_by_key(|s| std::cmp::Reverse(s.last_activity()));
        found
    }

    pub async fn sweep_inactive(&self) -> Vec<String> {
        self.sweep_inactive_at(Instant::now()).await
    }

    /// Destroy sessions unattached for longer than the idle timeout, and any
    /// whose shell is already gone.
    pub async fn sweep_inactive_at(&self, now: Instant) -> Vec<String> {
        let idle_timeout = self.settings.idle_timeout;
        let expired: Vec<(Arc<TerminalSession>, &'static str)> = self
            .sessions
            .read()
            .await
            .values()
            .filter_map(|s| {
                if !s.is_alive() {
                    return Some((s.clone(), "remote shell closed"));
                }
                let detached = s.detached_at()?;
                (now.saturating_duration_since(detached) > idle_timeout)
                    .then(|| (s.clone(), "inactivity timeout"))
            })
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for (session, reason) in expired {
            warn!(session_id = %session.id, reason, "sweeping session");
            self.destroy_exact(&session, reason).await;
            removed.push(session.id.clone());
        }
        if !removed.is_empty() {
            debug!(count = removed.len(), "sweep removed sessions");
        }
        removed
    }

    /// Run the sweep on the configured interval until the registry is dropped.
    pub async fn run_sweeper(self: Arc<Self>) {
        let registry = Arc::downgrade(&self);
        let period = self.settings.sweep_interval.max(Duration::from_secs(1));
        drop(self);
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(registry) = registry.upgrade() else {
                break;
            };
            registry.sweep_inactive().await;
        }
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .await
            .values()
            .map(|s| {
                let counters = s.counters();
                SessionInfo {
                    id: s.id.clone(),
                    device_id: s.device_id.clone(),
                    name: s.name.clone(),
                    status: s.status(),
                    attached: s.is_attached(),
                    idle_secs: s.last_activity().elapsed().as_secs(),
                    command_count: counters.command_count,
                    bytes_transmitted: counters.bytes_transmitted,
                }
            })
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Stop every shell for a process shutdown. Records are left
    /// `disconnected` so the next process can restore them.
    pub async fn close_all(&self, reason: &str) {
        let all: Vec<Arc<TerminalSession>> =
            self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in all {
            session.close(reason);
            self.ports.writer.counters(&session.id, session.counters());
            self.ports
                .writer
                .status(&session.id, SessionStatus::Disconnected);
            info!(session_id = %session.id, reason, "session suspended");
        }
    }
}

/// Per-session event loop: shell output in, client data and frames out.
async fn pump(
    registry: Weak<SessionRegistry>,
    session: Arc<TerminalSession>,
    mut events: mpsc::UnboundedReceiver<ShellEvent>,
) {
    let mut closed = session.closed_signal();
    if *closed.borrow_and_update() {
        return;
    }
    let reason = loop {
        tokio::select! {
            _ = closed.changed() => return,
            event = events.recv() => match event {
                Some(ShellEvent::Output(bytes)) => {
                    let outcome = session.ingest_output(&bytes);
                    let Some(registry) = registry.upgrade() else { return };
                    if let Some(entry) = outcome.frame {
                        registry.ports.writer.log(entry);
                    }
                    if outcome.client_lost {
                        registry.after_detach(&session);
                    }
                }
                Some(ShellEvent::Closed { reason }) => break reason,
                None => break "remote shell closed".to_string(),
            }
        }
    };
    if let Some(registry) = registry.upgrade() {
        registry.destroy_exact(&session, &reason).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::mock::RemoteEnd;
    use crate::shell::{AuthMethod, ShellCommand};
    use crate::testing::{client, creds, fixture, next_msg, Fixture, PEM};
    use std::time::Duration;

    async fn create(
        h: &Fixture,
        id: &str,
        conn_id: u64,
    ) -> (RemoteEnd, mpsc::UnboundedReceiver<ServerMessage>) {
        let (c, mut rx) = client(conn_id);
        h.registry
            .create_session(id, "fw-1", None, &creds(Some("pw"), None), c)
            .await
            .unwrap();
        assert!(matches!(next_msg(&mut rx).await, ServerMessage::Connect { .. }));
        (h.connector.take_remote().unwrap(), rx)
    }

    #[tokio::test]
    async fn private_key_only_connect_reaches_active() {
        let h = fixture();
        let (c, mut rx) = client(1);
        let session = h
            .registry
            .create_session("s1", "fw-1", None, &creds(None, Some(PEM)), c)
            .await
            .unwrap();
        assert_eq!(session.auth_method, AuthMethod::PrivateKey);
        assert_eq!(session.status(), SessionStatus::Active);
        assert!(matches!(next_msg(&mut rx).await, ServerMessage::Connect { .. }));
        h.writer.flush().await;
        assert_eq!(h.store.record("s1").unwrap().auth_method, AuthMethod::PrivateKey);
    }

    #[tokio::test]
    async fn connect_failures_register_nothing() {
        let h = fixture();
        let (c, _rx) = client(1);
        let err = h
            .registry
            .create_session("s1", "fw-1", None, &creds(None, None), c.clone())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GateError::Auth(_)));

        let err = h
            .registry
            .create_session("s1", "fw-1", None, &creds(None, Some("not a key")), c.clone())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GateError::KeyDecryption(_)));

        h.connector.fail_next(GateError::Shell("no pty".into()));
        let err = h
            .registry
            .create_session("s1", "fw-1", None, &creds(Some("pw"), None), c)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GateError::Shell(_)));
        assert_eq!(h.registry.count().await, 0);
    }

    #[tokio::test]
    async fn output_reaches_client_and_history() {
        let h = fixture();
        let (remote, mut rx) = create(&h, "s1", 1).await;
        remote.send("router# ");
        assert_eq!(next_msg(&mut rx).await, ServerMessage::data("router# "));
        let session = h.registry.session("s1").await.unwrap();
        assert_eq!(session.history(), "router# ");
    }

    #[tokio::test]
    async fn second_attach_replaces_first_client() {
        let h = fixture();
        let (remote, mut first) = create(&h, "s1", 1).await;
        remote.send("hello");
        next_msg(&mut first).await;

        let (second, mut second_rx) = client(2);
        assert!(h.registry.attach_client("s1", second).await);
        assert_eq!(next_msg(&mut second_rx).await, ServerMessage::data("hello"));
        assert!(matches!(next_msg(&mut first).await, ServerMessage::Close { .. }));

        remote.send("more");
        assert_eq!(next_msg(&mut second_rx).await, ServerMessage::data("more"));
        assert!(first.try_recv().is_err());
        let session = h.registry.session("s1").await.unwrap();
        assert_eq!(session.client_conn_id(), Some(2));
    }

    #[tokio::test]
    async fn reconnect_replays_same_history() {
        let h = fixture();
        let (remote, mut rx) = create(&h, "s1", 1).await;
        remote.send("line one\r\n");
        remote.send("line two\r\n");
        next_msg(&mut rx).await;
        next_msg(&mut rx).await;

        h.registry.detach_client("s1").await;
        assert_eq!(
            h.registry.session("s1").await.unwrap().status(),
            SessionStatus::Disconnected
        );

        let (again, mut again_rx) = client(2);
        assert!(h.registry.attach_client("s1", again).await);
        assert_eq!(
            next_msg(&mut again_rx).await,
            ServerMessage::data("line one\r\nline two\r\n")
        );
    }

    #[tokio::test]
    async fn detach_and_destroy_are_idempotent() {
        let h = fixture();
        let (mut remote, mut rx) = create(&h, "s1", 1).await;
        h.registry.detach_client("s1").await;
        h.registry.detach_client("s1").await;
        h.registry.detach_client("unknown").await;

        h.registry.destroy_session("s1", "bye").await;
        h.registry.destroy_session("s1", "bye").await;
        assert_eq!(remote.next_command().await, Some(ShellCommand::Close));
        assert_eq!(h.registry.count().await, 0);

        let (c, _rx2) = client(2);
        assert!(!h.registry.attach_client("s1", c).await);
        assert!(rx.try_recv().is_err());

        h.writer.flush().await;
        assert_eq!(h.store.record("s1").unwrap().status, SessionStatus::Closed);
    }

    #[tokio::test]
    async fn stale_connection_cannot_detach_newer_binding() {
        let h = fixture();
        let (_remote, _rx) = create(&h, "s1", 1).await;
        let (c2, _rx2) = client(2);
        assert!(h.registry.attach_client("s1", c2).await);
        assert!(!h.registry.detach_if_bound("s1", 1).await);
        assert!(h.registry.session("s1").await.unwrap().is_attached());
        assert!(h.registry.detach_if_bound("s1", 2).await);
    }

    #[tokio::test]
    async fn remote_close_destroys_and_notifies() {
        let h = fixture();
        let (remote, mut rx) = create(&h, "s1", 1).await;
        remote.hang_up("remote shell exited");
        assert_eq!(
            next_msg(&mut rx).await,
            ServerMessage::close("remote shell exited")
        );
        for _ in 0..50 {
            if h.registry.count().await == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(h.registry.count().await, 0);
    }

    #[tokio::test]
    async fn dead_shell_cannot_be_attached() {
        let h = fixture();
        let (remote, _rx) = create(&h, "s1", 1).await;
        h.registry.detach_client("s1").await;
        // dropping the far end closes the command channel
        drop(remote);
        let (c, _rx2) = client(2);
        assert!(!h.registry.attach_client("s1", c).await);
    }

    #[tokio::test]
    async fn data_counts_commands_and_logs_them() {
        let h = fixture();
        let (mut remote, _rx) = create(&h, "s1", 1).await;
        h.registry
            .handle_client_message(
                "s1",
                &ClientMessage::TerminalData {
                    data: "show version\r".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            remote.next_command().await,
            Some(ShellCommand::Write(b"show version\r".to_vec()))
        );
        h.registry
            .handle_client_message("s1", &ClientMessage::TerminalResize { cols: 120, rows: 40 })
            .await
            .unwrap();
        assert_eq!(
            remote.next_command().await,
            Some(ShellCommand::Resize { cols: 120, rows: 40 })
        );

        h.writer.flush().await;
        let logs = h.store.log_entries("s1");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].content, "show version");
        assert!(logs[0].raw);
        assert_eq!(h.store.record("s1").unwrap().command_count, 1);
    }

    #[tokio::test]
    async fn messages_for_unknown_sessions_fail() {
        let h = fixture();
        let err = h
            .registry
            .handle_client_message("nope", &ClientMessage::TerminalData { data: "x".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn sweep_removes_only_long_detached_sessions() {
        let h = fixture();
        let (_r1, _rx1) = create(&h, "attached", 1).await;
        let (_r2, _rx2) = create(&h, "idle", 2).await;
        h.registry.detach_client("idle").await;

        let now = Instant::now();
        assert!(h.registry.sweep_inactive_at(now).await.is_empty());
        let later = now + h.registry.settings.idle_timeout + Duration::from_secs(1);
        assert_eq!(h.registry.sweep_inactive_at(later).await, vec!["idle".to_string()]);
        assert_eq!(h.registry.count().await, 1);
    }

    #[tokio::test]
    async fn resumable_for_device_orders_by_activity() {
        let h = fixture();
        let (r1, mut rx1) = create(&h, "older", 1).await;
        let (_r2, _rx2) = create(&h, "newer", 2).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        r1.send("x");
        next_msg(&mut rx1).await;
        let ids: Vec<String> = h
            .registry
            .resumable_for_device("fw-1")
            .await
            .iter()
            .map(|s| s.id.clone())
            .collect();
        assert_eq!(ids, vec!["older".to_string(), "newer".to_string()]);
        assert!(h.registry.resumable_for_device("fw-2").await.is_empty());
    }

    #[tokio::test]
    async fn restore_reopens_stored_session() {
        let h = fixture();
        let mut record = SessionRecord::new("old", "fw-1", Some("core".into()), AuthMethod::Password);
        record.status = SessionStatus::Disconnected;
        record.command_count = 7;
        h.store.create_session_record(&record).await.unwrap();

        let (c, mut rx) = client(1);
        assert!(h.registry.restore_from_store("old", c).await.unwrap());
        assert!(matches!(next_msg(&mut rx).await, ServerMessage::Connect { .. }));
        let session = h.registry.session("old").await.unwrap();
        assert_eq!(session.name.as_deref(), Some("core"));
        assert_eq!(session.counters().command_count, 7);
        assert!(session.history().is_empty());
    }

    #[tokio::test]
    async fn restore_refuses_closed_or_expired_records() {
        let h = fixture();
        let mut closed = SessionRecord::new("closed", "fw-1", None, AuthMethod::Password);
        closed.status = SessionStatus::Closed;
        let mut expired = SessionRecord::new("expired", "fw-1", None, AuthMethod::Password);
        expired.updated_at = Utc::now() - chrono::Duration::hours(5);
        h.store.create_session_record(&closed).await.unwrap();
        h.store.create_session_record(&expired).await.unwrap();

        for id in ["closed", "expired", "missing"] {
            let (c, _rx) = client(1);
            assert!(!h.registry.restore_from_store(id, c).await.unwrap(), "{id}");
        }
        assert_eq!(h.connector.pending(), 0);
        assert_eq!(h.registry.count().await, 0);
    }

    #[tokio::test]
    async fn shutdown_leaves_sessions_restorable() {
        let h = fixture();
        let (_remote, mut rx) = create(&h, "s1", 1).await;
        h.registry.close_all("server shutting down").await;
        assert_eq!(
            next_msg(&mut rx).await,
            ServerMessage::close("server shutting down")
        );
        assert_eq!(h.registry.count().await, 0);
        h.writer.flush().await;
        assert_eq!(h.store.record("s1").unwrap().status, SessionStatus::Disconnected);

        let restarted = h.restarted_registry();
        let (c, mut rx2) = client(2);
        assert!(restarted.restore_from_store("s1", c).await.unwrap());
        assert!(matches!(next_msg(&mut rx2).await, ServerMessage::Connect { .. }));
        assert_eq!(restarted.count().await, 1);
    }

    #[tokio::test]
    async fn concurrent_restores_open_one_shell() {
        let h = fixture();
        let mut record = SessionRecord::new("old", "fw-1", None, AuthMethod::Password);
        record.status = SessionStatus::Disconnected;
        h.store.create_session_record(&record).await.unwrap();
        h.connector.set_delay(Duration::from_millis(50));

        let (c1, _rx1) = client(1);
        let (c2, _rx2) = client(2);
        let (a, b) = tokio::join!(
            h.registry.restore_from_store("old", c1),
            h.registry.restore_from_store("old", c2)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a != b, "exactly one restore wins: a={a} b={b}");
        assert_eq!(h.connector.pending(), 1);
        assert_eq!(h.registry.count().await, 1);
    }

    #[tokio::test]
    async fn create_refuses_an_id_that_is_still_opening() {
        let h = fixture();
        h.connector.set_delay(Duration::from_millis(50));
        let (c1, _rx1) = client(1);
        let (c2, _rx2) = client(2);
        let creds = creds(Some("pw"), None);
        let (a, b) = tokio::join!(
            h.registry.create_session("s1", "fw-1", None, &creds, c1),
            h.registry.create_session("s1", "fw-1", None, &creds, c2)
        );
        assert!(a.is_ok());
        assert!(matches!(b, Err(GateError::Other(_))));
        assert_eq!(h.connector.pending(), 1);
    }

    #[tokio::test]
    async fn restored_duration_continues_from_the_record() {
        let h = fixture();
        let mut record = SessionRecord::new("old", "fw-1", None, AuthMethod::Password);
        record.status = SessionStatus::Disconnected;
        record.duration_secs = 600;
        h.store.create_session_record(&record).await.unwrap();

        let (c, _rx) = client(1);
        assert!(h.registry.restore_from_store("old", c).await.unwrap());
        let session = h.registry.session("old").await.unwrap();
        assert!(session.counters().duration_secs >= 600);
    }
}
