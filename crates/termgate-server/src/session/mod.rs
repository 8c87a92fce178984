//! Terminal sessions and the registry that owns them.

pub mod history;
pub mod registry;

pub use history::HistoryBuffer;
pub use registry::{RegistryPorts, SessionRegistry};

use crate::config::SessionSettings;
use crate::shell::{AuthMethod, ShellCommand};
use crate::store::{LogEntry, SessionCounters, SessionStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::time::Instant;
use termgate_core::emulator::{CliHeuristics, TerminalEmulator};
use termgate_core::{FrameKind, ServerMessage};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Outbound side of one client connection.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub conn_id: u64,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ClientHandle {
    pub fn new(conn_id: u64, tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self { conn_id, tx }
    }

    /// False once the connection is gone.
    pub fn send(&self, msg: ServerMessage) -> bool {
        self.tx.send(msg).is_ok()
    }
}

/// What happened while applying one chunk of shell output.
#[derive(Debug, Default)]
pub(crate) struct OutputOutcome {
    pub frame: Option<LogEntry>,
    /// The bound client could not take the data and was detached.
    pub client_lost: bool,
}

/// A live shell on a device, with at most one attached client.
pub struct TerminalSession {
    pub id: String,
    pub device_id: String,
    pub name: Option<String>,
    pub auth_method: AuthMethod,
    pub created_at: DateTime<Utc>,
    started: Instant,
    /// Duration already accrued by earlier incarnations of this session.
    carried_secs: u64,
    shell: mpsc::UnboundedSender<ShellCommand>,
    closed: watch::Sender<bool>,
    state: Mutex<SessionState>,
}

struct SessionState {
    client: Option<ClientHandle>,
    status: SessionStatus,
    last_activity: Instant,
    detached_at: Option<Instant>,
    command_count: u64,
    bytes_in: u64,
    bytes_out: u64,
    history: HistoryBuffer,
    emulator: TerminalEmulator,
    input_line: String,
    input_escape: bool,
    log_seq: u64,
    utf8_carry: Vec<u8>,
}

pub(crate) struct SessionParams {
    pub id: String,
    pub device_id: String,
    pub name: Option<String>,
    pub auth_method: AuthMethod,
    pub created_at: DateTime<Utc>,
    pub carried: SessionCounters,
    pub client: ClientHandle,
}

impl TerminalSession {
    pub(crate) fn new(
        params: SessionParams,
        shell: mpsc::UnboundedSender<ShellCommand>,
        settings: &SessionSettings,
    ) -> Self {
        let now = Instant::now();
        let emulator = TerminalEmulator::with_classifier(
            settings.cols,
            settings.rows,
            Box::new(CliHeuristics::new(settings.heuristics.clone())),
            settings.capture.clone(),
        );
        let (closed, _) = watch::channel(false);
        Self {
            id: params.id,
            device_id: params.device_id,
            name: params.name,
            auth_method: params.auth_method,
            created_at: params.created_at,
            started: now,
            carried_secs: params.carried.duration_secs,
            shell,
            closed,
            state: Mutex::new(SessionState {
                client: Some(params.client),
                status: SessionStatus::Active,
                last_activity: now,
                detached_at: None,
                command_count: params.carried.command_count,
                bytes_in: 0,
                bytes_out: params.carried.bytes_transmitted,
                history: HistoryBuffer::new(settings.history_cap, settings.history_trim),
                emulator,
                input_line: String::new(),
                input_escape: false,
                log_seq: 0,
                utf8_carry: Vec::new(),
            }),
        }
    }

    /// The remote shell is still running.
    pub fn is_alive(&self) -> bool {
        !self.shell.is_closed() && !*self.closed.borrow()
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().client.is_some()
    }

    /// Connection id of the bound client.
    pub fn client_conn_id(&self) -> Option<u64> {
        self.state.lock().client.as_ref().map(|c| c.conn_id)
    }

    pub fn last_activity(&self) -> Instant {
        self.state.lock().last_activity
    }

    pub fn detached_at(&self) -> Option<Instant> {
        self.state.lock().detached_at
    }

    #[cfg(test)]
    pub fn history(&self) -> String {
        self.state.lock().history.as_str().to_string()
    }

    pub fn counters(&self) -> SessionCounters {
        let state = self.state.lock();
        SessionCounters {
            duration_secs: self.carried_secs + self.started.elapsed().as_secs(),
            command_count: state.command_count,
            bytes_transmitted: state.bytes_in + state.bytes_out,
        }
    }

    #[cfg(test)]
    pub fn bytes(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.bytes_in, state.bytes_out)
    }

    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Bind `client`, replaying history to it. Returns the client it replaced.
    pub(crate) fn bind(&self, client: ClientHandle) -> Option<ClientHandle> {
        let mut state = self.state.lock();
        if !state.history.is_empty() {
            debug!(session_id = %self.id, bytes = state.history.len(), "replaying history");
            client.send(ServerMessage::data(state.history.as_str()));
        }
        state.status = SessionStatus::Active;
        state.detached_at = None;
        state.last_activity = Instant::now();
        state.client.replace(client)
    }

    /// Clear the client binding. Returns false if nothing was bound.
    pub(crate) fn unbind(&self) -> bool {
        let mut state = self.state.lock();
        Self::detach_locked(&mut state)
    }

    /// Unbind only if `conn_id` is the bound connection.
    pub(crate) fn unbind_if(&self, conn_id: u64) -> bool {
        let mut state = self.state.lock();
        if state.client.as_ref().map(|c| c.conn_id) != Some(conn_id) {
            return false;
        }
        Self::detach_locked(&mut state)
    }

    fn detach_locked(state: &mut SessionState) -> bool {
        if state.client.take().is_none() {
            return false;
        }
        if state.status != SessionStatus::Closed {
            state.status = SessionStatus::Disconnected;
            let now = Instant::now();
            state.detached_at = Some(now);
            state.last_activity = now;
        }
        true
    }

    /// Mark closed, tell the client and stop the shell.
    pub(crate) fn close(&self, reason: &str) {
        let client = {
            let mut state = self.state.lock();
            state.status = SessionStatus::Closed;
            state.client.take()
        };
        if let Some(client) = client {
            client.send(ServerMessage::close(reason));
        }
        let _ = self.shell.send(ShellCommand::Close);
        self.closed.send_replace(true);
    }

    /// History, client forwarding and frame extraction for one output chunk.
    pub(crate) fn ingest_output(&self, bytes: &[u8]) -> OutputOutcome {
        let mut outcome = OutputOutcome::default();
        let mut state = self.state.lock();
        state.bytes_out += bytes.len() as u64;
        state.last_activity = Instant::now();

        let text = decode_utf8(&mut state.utf8_carry, bytes);
        if text.is_empty() {
            return outcome;
        }
        state.history.push(&text);

        let delivered = state
            .client
            .as_ref()
            .map(|c| c.send(ServerMessage::data(text.as_str())));
        if delivered == Some(false) {
            outcome.client_lost = Self::detach_locked(&mut state);
        }

        if let Some(frame) = state.emulator.feed(&text) {
            state.log_seq += 1;
            outcome.frame = Some(LogEntry {
                session_id: self.id.clone(),
                entry_type: frame.kind.as_str().to_string(),
                content: frame.text(),
                seq: state.log_seq,
                is_input: frame.kind == FrameKind::Input,
                raw: false,
                timestamp: frame.timestamp,
            });
        }
        outcome
    }

    /// Forward client keystrokes to the shell. Returns log entries for every
    /// command line submitted.
    pub(crate) fn ingest_input(&self, data: &str) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        {
            let mut state = self.state.lock();
            state.bytes_in += data.len() as u64;
            state.last_activity = Instant::now();
            for ch in data.chars() {
                if state.input_escape {
                    // CSI/SS3 sequences from arrow and function keys end on
                    // a letter or `~`
                    if ch.is_ascii_alphabetic() && ch != 'O' || ch == '~' {
                        state.input_escape = false;
                    }
                    continue;
                }
                match ch {
                    '\r' | '\n' => {
                        let line = state.input_line.trim().to_string();
                        state.input_line.clear();
                        if line.is_empty() {
                            continue;
                        }
                        state.command_count += 1;
                        state.log_seq += 1;
                        entries.push(LogEntry {
                            session_id: self.id.clone(),
                            entry_type: "command".to_string(),
                            content: line,
                            seq: state.log_seq,
                            is_input: true,
                            raw: true,
                            timestamp: Utc::now(),
                        });
                    }
                    '\x7f' | '\x08' => {
                        state.input_line.pop();
                    }
                    '\x03' | '\x15' => state.input_line.clear(),
                    '\x1b' => state.input_escape = true,
                    c if c.is_control() => {}
                    c => state.input_line.push(c),
                }
            }
        }
        let _ = self.shell.send(ShellCommand::Write(data.as_bytes().to_vec()));
        entries
    }

    pub(crate) fn resize(&self, cols: u16, rows: u16) {
        self.state.lock().emulator.resize(cols, rows);
        let _ = self.shell.send(ShellCommand::Resize { cols, rows });
    }
}

/// Decode `bytes` after any carried partial sequence. An incomplete sequence
/// at the end is kept for the next call; invalid bytes become U+FFFD.
fn decode_utf8(carry: &mut Vec<u8>, bytes: &[u8]) -> String {
    carry.extend_from_slice(bytes);
    let mut out = String::new();
    loop {
        match std::str::from_utf8(carry) {
            Ok(s) => {
                out.push_str(s);
                carry.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&carry[..valid]));
                match e.error_len() {
                    None => {
                        carry.drain(..valid);
                        return out;
                    }
                    Some(len) => {
                        out.push('\u{fffd}');
                        carry.drain(..valid + len);
                    }
                }
            }
        }
    }
}
