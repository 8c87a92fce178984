//! Fire-and-forget store writes.
//!
//! Session I/O must never wait on persistence. Writes are queued on an
//! unbounded channel and applied in order by one task; failures are logged
//! and dropped.

use super::{LogEntry, SessionCounters, SessionRecord, SessionStatus, SessionStore};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug)]
pub enum StoreOp {
    Create(SessionRecord),
    Status {
        id: String,
        status: SessionStatus,
    },
    Counters {
        id: String,
        counters: SessionCounters,
    },
    Log(LogEntry),
    /// Resolves once every earlier op has been applied.
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
pub struct StoreWriter {
    tx: mpsc::UnboundedSender<StoreOp>,
}

impl StoreWriter {
    /// Spawn the writer task. It ends when every `StoreWriter` clone is dropped.
    pub fn spawn(store: Arc<dyn SessionStore>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<StoreOp>();
        let handle = tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                apply(store.as_ref(), op).await;
            }
            debug!("store writer stopped");
        });
        (Self { tx }, handle)
    }

    pub fn submit(&self, op: StoreOp) {
        if self.tx.send(op).is_err() {
            warn!("store writer is gone, dropping write");
        }
    }

    pub fn create(&self, record: SessionRecord) {
        self.submit(StoreOp::Create(record));
    }

    pub fn status(&self, id: &str, status: SessionStatus) {
        self.submit(StoreOp::Status {
            id: id.to_string(),
            status,
        });
    }

    pub fn counters(&self, id: &str, counters: SessionCounters) {
        self.submit(StoreOp::Counters {
            id: id.to_string(),
            counters,
        });
    }

    pub fn log(&self, entry: LogEntry) {
        self.submit(StoreOp::Log(entry));
    }

    /// Wait until everything queued so far has been written.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.submit(StoreOp::Flush(tx));
        let _ = rx.await;
    }
}

async fn apply(store: &dyn SessionStore, op: StoreOp) {
    let result = match op {
        StoreOp::Create(record) => store.create_session_record(&record).await,
        StoreOp::Status { id, status } => store.update_session_status(&id, status).await,
        StoreOp::Counters { id, counters } => store.update_session_counters(&id, counters).await,
        StoreOp::Log(entry) => store.append_log_entry(&entry).await,
        StoreOp::Flush(done) => {
            let _ = done.send(());
            Ok(())
        }
    };
    if let Err(e) = result {
        warn!(error = %e, "store write failed");
    }
}
