//! Core server: wires the store, device directory, SSH connector and
//! session registry together and accepts WebSocket clients.
//!
//! Also runs the background tasks: the idle session sweeper and the device
//! status poller that feeds `device-status` subscriptions.

use crate::config::{DeviceEntry, ServerConfig};
use crate::device::StaticDirectory;
use crate::gateway::Gateway;
use crate::session::{RegistryPorts, SessionRegistry};
use crate::shell::SshConnector;
use crate::store::{MemoryStore, SessionStore, SqliteStore, StoreWriter};
use crate::transport::websocket;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use termgate_core::{DeviceStatus, GateError, GateResult};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// How long a reachability probe waits for the SSH port.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// The termgate server instance.
pub struct TermgateServer {
    config: ServerConfig,
    devices: Arc<StaticDirectory>,
    writer: StoreWriter,
    gateway: Arc<Gateway>,
}

impl TermgateServer {
    /// Create a new server instance. Must be called inside a runtime.
    pub fn new(config: ServerConfig) -> GateResult<Self> {
        let store: Arc<dyn SessionStore> = match &config.store_path {
            Some(path) => {
                info!(path = %path.display(), "using sqlite session store");
                Arc::new(SqliteStore::open(path)?)
            }
            None => {
                warn!("no store path configured, sessions will not survive a restart");
                Arc::new(MemoryStore::new())
            }
        };
        let (writer, _writer_task) = StoreWriter::spawn(store.clone());

        let devices = Arc::new(StaticDirectory::from_entries(&config.devices));
        if config.devices.is_empty() {
            warn!("no devices configured, every terminal-connect will fail");
        } else {
            info!(count = config.devices.len(), "loaded devices");
        }

        let registry = SessionRegistry::new(
            RegistryPorts {
                connector: Arc::new(SshConnector::new(config.sessions.connect_timeout)),
                decryptor: Arc::new(crate::device::PemKeyDecryptor),
                devices: devices.clone(),
                store,
                writer: writer.clone(),
            },
            config.sessions.clone(),
        );
        let gateway = Gateway::new(registry, config.heartbeat_interval);

        Ok(Self {
            config,
            devices,
            writer,
            gateway,
        })
    }

    /// Accept connections until the listener closes.
    pub async fn run(&self) -> GateResult<()> {
        let ws_addr: SocketAddr = format!("{}:{}", self.config.bind, self.config.port)
            .parse()
            .map_err(|e| GateError::Config(format!("invalid address: {e}")))?;
        let (local_addr, mut ws_rx) = websocket::start_listener(ws_addr).await?;

        tokio::spawn(self.gateway.registry().clone().run_sweeper());
        tokio::spawn(poll_device_status(
            self.gateway.clone(),
            self.devices.clone(),
            self.config.devices.clone(),
            self.config.status_poll_interval,
            self.config.probe_devices,
        ));

        info!(addr = %local_addr, "termgate-server ready");

        loop {
            tokio::select! {
                Some(conn) = ws_rx.recv() => {
                    let gateway = self.gateway.clone();
                    tokio::spawn(async move {
                        gateway.serve(conn.ws_stream, conn.remote_addr).await;
                    });
                }
                else => {
                    info!("listener closed, shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Close every connection and session, then wait for pending store writes.
    pub async fn shutdown(&self) {
        self.gateway.shutdown();
        for s in self.gateway.registry().list().await {
            info!(
                session_id = %s.id,
                device_id = %s.device_id,
                attached = s.attached,
                idle_secs = s.idle_secs,
                commands = s.command_count,
                bytes = s.bytes_transmitted,
                "closing session"
            );
        }
        self.gateway.registry().close_all("server shutting down").await;
        self.writer.flush().await;
        info!("session state flushed");
    }
}

async fn poll_device_status(
    gateway: Arc<Gateway>,
    directory: Arc<StaticDirectory>,
    devices: Vec<DeviceEntry>,
    period: Duration,
    probe: bool,
) {
    let mut last: HashMap<String, DeviceStatus> = HashMap::new();
    gateway.publish_changes(&mut last);
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        if probe {
            for device in &devices {
                let status = probe_device(&device.host, device.port).await;
                if directory.set_status(&device.id, status) {
                    debug!(device_id = %device.id, status = status.as_str(), "probe changed status");
                }
            }
        }
        gateway.publish_changes(&mut last);
    }
}

/// Online if the SSH port accepts a TCP connection within [`PROBE_TIMEOUT`].
async fn probe_device(host: &str, port: u16) -> DeviceStatus {
    match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => DeviceStatus::Online,
        _ => DeviceStatus::Offline,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn probe_reports_reachability() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_eq!(probe_device("127.0.0.1", port).await, DeviceStatus::Online);
        drop(listener);
        assert_eq!(probe_device("127.0.0.1", port).await, DeviceStatus::Offline);
    }

    #[tokio::test]
    async fn server_builds_with_memory_store() {
        let config = ServerConfig::resolve(
            ServerConfig::parse(
                r#"
                [[devices]]
                id = "fw-1"
                host = "127.0.0.1"
                username = "admin"
                password = "pw"
                "#,
            )
            .unwrap(),
            Default::default(),
        )
        .unwrap();
        let server = TermgateServer::new(config).unwrap();
        assert_eq!(server.gateway.registry().count().await, 0);
        server.shutdown().await;
    }
}
