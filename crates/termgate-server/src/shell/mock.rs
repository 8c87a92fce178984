//! In-process shell connector for tests.

use super::{ShellCommand, ShellConnector, ShellEvent, ShellHandle, ShellTarget};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use termgate_core::{GateError, GateResult};
use tokio::sync::mpsc;

/// Far end of a mock shell: push output, observe commands.
pub struct RemoteEnd {
    pub target: ShellTarget,
    pub output: mpsc::UnboundedSender<ShellEvent>,
    pub commands: mpsc::UnboundedReceiver<ShellCommand>,
}

impl RemoteEnd {
    pub fn send(&self, text: &str) {
        let _ = self.output.send(ShellEvent::Output(text.as_bytes().to_vec()));
    }

    pub fn send_bytes(&self, bytes: &[u8]) {
        let _ = self.output.send(ShellEvent::Output(bytes.to_vec()));
    }

    pub fn hang_up(&self, reason: &str) {
        let _ = self.output.send(ShellEvent::Closed {
            reason: reason.to_string(),
        });
    }

    /// Next command the session sent.
    pub async fn next_command(&mut self) -> Option<ShellCommand> {
        self.commands.recv().await
    }
}

#[derive(Default)]
pub struct MockConnector {
    failures: Mutex<VecDeque<GateError>>,
    opened: Mutex<Vec<RemoteEnd>>,
    delay: Mutex<Option<Duration>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `open` fail with `err`.
    pub fn fail_next(&self, err: GateError) {
        self.failures.lock().push_back(err);
    }

    /// Make every `open` take `delay` before it connects.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Take the far end of the oldest opened shell not yet taken.
    pub fn take_remote(&self) -> Option<RemoteEnd> {
        let mut opened = self.opened.lock();
        if opened.is_empty() {
            None
        } else {
            Some(opened.remove(0))
        }
    }

    pub fn pending(&self) -> usize {
        self.opened.lock().len()
    }
}

#[async_trait]
impl ShellConnector for MockConnector {
    async fn open(&self, target: ShellTarget, _cols: u16, _rows: u16) -> GateResult<ShellHandle> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        self.opened.lock().push(RemoteEnd {
            target,
            output: event_tx,
            commands: input_rx,
        });
        Ok(ShellHandle {
            input: input_tx,
            events: event_rx,
        })
    }
}
