//! Connection gateway: one task per browser WebSocket.
//!
//! Parses JSON frames, keeps at most one bound terminal session per
//! connection, manages device-status subscriptions and runs the heartbeat.
//!
//! # Submodules
//!
//! - **[`resolve`]** picks the session a `terminal-connect` attaches to.
//! - **[`subscriptions`]** fans device status changes out to subscribers.

pub mod resolve;
pub mod subscriptions;

pub use resolve::{resolve_session, Resolution};
pub use subscriptions::DeviceSubscriptions;

use crate::session::{ClientHandle, SessionRegistry};
use crate::transport::websocket::{self, Inbound};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use termgate_core::{ClientMessage, DeviceStatus, GateError, GateResult, ServerMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinHandle};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Per-connection state threaded through the dispatch loop.
struct ConnectionContext {
    conn_id: u64,
    client: ClientHandle,
    /// Session this connection is attached to, if any.
    bound: Option<String>,
    /// In-flight `terminal-connect`, resolved off the connection loop.
    connecting: Option<JoinHandle<ConnectOutcome>>,
}

/// Device id and the resolution result of one `terminal-connect`.
type ConnectOutcome = (String, GateResult<Resolution>);

async fn join_connect(
    task: &mut Option<JoinHandle<ConnectOutcome>>,
) -> Result<ConnectOutcome, JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

pub struct Gateway {
    registry: Arc<SessionRegistry>,
    subscriptions: DeviceSubscriptions,
    heartbeat: Duration,
    next_conn_id: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl Gateway {
    pub fn new(registry: Arc<SessionRegistry>, heartbeat: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry,
            subscriptions: DeviceSubscriptions::new(),
            heartbeat,
            next_conn_id: AtomicU64::new(1),
            shutdown_tx: broadcast::channel(1).0,
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Ask every connection loop to say goodbye and stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn publish_device_status(&self, device_id: &str, status: DeviceStatus) -> usize {
        self.subscriptions.publish(device_id, status)
    }

    /// Publish every status that differs from `last`, updating it.
    pub fn publish_changes(&self, last: &mut HashMap<String, DeviceStatus>) -> usize {
        let mut changed = 0;
        for (device_id, status) in self.registry.devices().statuses() {
            if last.get(&device_id) == Some(&status) {
                continue;
            }
            if last.contains_key(&device_id) {
                info!(device_id = %device_id, status = status.as_str(), "device status changed");
                self.publish_device_status(&device_id, status);
                changed += 1;
            }
            last.insert(device_id, status);
        }
        changed
    }

    /// Serve one WebSocket until it closes, fails the heartbeat, or the
    /// server shuts down. The bound session is detached, never destroyed.
    pub async fn serve<S>(&self, ws: WebSocketStream<S>, remote: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let mut ctx = ConnectionContext {
            conn_id,
            client: ClientHandle::new(conn_id, out_tx),
            bound: None,
            connecting: None,
        };
        info!(conn_id, remote = %remote, "client connected");

        let (mut sink, mut stream) = ws.split();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + self.heartbeat,
            self.heartbeat,
        );
        let mut alive = true;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(conn_id, "shutdown signal received, notifying client");
                    if let Ok(frame) = websocket::text_frame(&ServerMessage::close("server shutting down")) {
                        let _ = sink.send(frame).await;
                    }
                    let _ = sink.close().await;
                    break;
                }

                Some(msg) = out_rx.recv() => {
                    let frame = match websocket::text_frame(&msg) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(conn_id, error = %e, "failed to encode message");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(frame).await {
                        debug!(conn_id, error = %e, "WS send failed");
                        break;
                    }
                }

                outcome = join_connect(&mut ctx.connecting), if ctx.connecting.is_some() => {
                    ctx.connecting = None;
                    self.finish_connect(&mut ctx, outcome);
                }

                _ = heartbeat.tick() => {
                    if !alive {
                        warn!(conn_id, "heartbeat missed, terminating connection");
                        break;
                    }
                    alive = false;
                    if sink.send(websocket::ping_frame()).await.is_err() {
                        break;
                    }
                }

                frame = stream.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => {
                            debug!(conn_id, error = %e, "WS recv failed");
                            break;
                        }
                        None => break,
                    };
                    match websocket::classify(frame) {
                        Ok(Inbound::Text(text)) => {
                            alive = true;
                            self.handle_text(&mut ctx, &text).await;
                        }
                        Ok(Inbound::Pong) => alive = true,
                        Ok(Inbound::Ping(payload)) => {
                            alive = true;
                            let _ = sink.send(websocket::pong_frame(payload)).await;
                        }
                        Ok(Inbound::Close) => break,
                        Ok(Inbound::Unsupported) => {
                            ctx.client.send(ServerMessage::error("only JSON text frames are supported"));
                        }
                        Err(e) => {
                            ctx.client.send(ServerMessage::error(e.to_string()));
                        }
                    }
                }
            }
        }

        if let Some(id) = ctx.bound.take() {
            self.registry.detach_if_bound(&id, conn_id).await;
        }
        if let Some(pending) = ctx.connecting.take() {
            // the connect may still bind this dead connection; undo it once done
            let registry = self.registry.clone();
            tokio::spawn(async move {
                if let Ok((_, Ok(resolution))) = pending.await {
                    registry.detach_if_bound(&resolution.session_id, conn_id).await;
                }
            });
        }
        self.subscriptions.remove_connection(conn_id);
        info!(conn_id, "client disconnected");
    }

    async fn handle_text(&self, ctx: &mut ConnectionContext, text: &str) {
        let result = match ClientMessage::parse(text) {
            Ok(msg) => {
                debug!(conn_id = ctx.conn_id, kind = msg.kind(), "client message");
                self.dispatch(ctx, msg).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            if e.is_connect_failure() {
                warn!(conn_id = ctx.conn_id, error = %e, "terminal connect failed");
            } else {
                debug!(conn_id = ctx.conn_id, error = %e, "rejected client message");
            }
            ctx.client.send(ServerMessage::error(e.to_string()));
        }
    }

    async fn dispatch(&self, ctx: &mut ConnectionContext, msg: ClientMessage) -> GateResult<()> {
        match msg {
            ClientMessage::Ping => {
                ctx.client.send(ServerMessage::Pong);
                Ok(())
            }
            ClientMessage::Pong => Ok(()),
            ClientMessage::Subscribe { device_id } => {
                let status = self
                    .registry
                    .devices()
                    .device(&device_id)
                    .map_or(DeviceStatus::Unknown, |d| d.status);
                self.subscriptions.subscribe(&device_id, ctx.client.clone());
                ctx.client.send(ServerMessage::DeviceStatus { device_id, status });
                Ok(())
            }
            ClientMessage::Unsubscribe { device_id } => {
                self.subscriptions.unsubscribe(&device_id, ctx.conn_id);
                Ok(())
            }
            ClientMessage::TerminalConnect {
                device_id,
                session_name,
                session_id,
            } => self.connect(ctx, &device_id, session_name, session_id).await,
            ClientMessage::TerminalData { .. } | ClientMessage::TerminalResize { .. } => {
                match self.owned_session(ctx).await {
                    Some(id) => self.registry.handle_client_message(&id, &msg).await,
                    None => Ok(()),
                }
            }
            ClientMessage::TerminalDisconnect => {
                if let Some(id) = ctx.bound.take() {
                    self.registry.detach_if_bound(&id, ctx.conn_id).await;
                }
                Ok(())
            }
            ClientMessage::TerminalTerminate => {
                if let Some(id) = self.owned_session(ctx).await {
                    ctx.bound = None;
                    self.registry.destroy_session(&id, "terminated by user").await;
                }
                Ok(())
            }
        }
    }

    /// The bound session id while this connection still holds the binding.
    /// A connection whose session was taken over forgets it.
    async fn owned_session(&self, ctx: &mut ConnectionContext) -> Option<String> {
        let id = ctx.bound.clone()?;
        let owned = match self.registry.session(&id).await {
            Some(session) => session.client_conn_id() == Some(ctx.conn_id),
            None => false,
        };
        if owned {
            Some(id)
        } else {
            debug!(conn_id = ctx.conn_id, session_id = %id, "binding lost, dropping session");
            ctx.bound = None;
            None
        }
    }

    /// Validate the device and start resolving the session. The shell open
    /// runs in its own task; the result lands in [`Self::finish_connect`].
    async fn connect(
        &self,
        ctx: &mut ConnectionContext,
        device_id: &str,
        session_name: Option<String>,
        session_id: Option<String>,
    ) -> GateResult<()> {
        if ctx.connecting.is_some() {
            return Err(GateError::InvalidMessage(
                "a terminal-connect is already in progress".to_string(),
            ));
        }
        let device = self
            .registry
            .devices()
            .device(device_id)
            .ok_or_else(|| GateError::DeviceUnavailable(format!("unknown device {device_id}")))?;
        if device.status != DeviceStatus::Online {
            return Err(GateError::DeviceUnavailable(format!(
                "{} is {}",
                device.name,
                device.status.as_str()
            )));
        }

        if let Some(previous) = ctx.bound.take() {
            self.registry.detach_if_bound(&previous, ctx.conn_id).await;
        }

        let registry = self.registry.clone();
        let client = ctx.client.clone();
        ctx.connecting = Some(tokio::spawn(async move {
            let result =
                resolve_session(&registry, &device, session_id.as_deref(), session_name, client)
                    .await;
            (device.id, result)
        }));
        Ok(())
    }

    fn finish_connect(
        &self,
        ctx: &mut ConnectionContext,
        outcome: Result<ConnectOutcome, JoinError>,
    ) {
        let (device_id, resolution) = match outcome {
            Ok((device_id, Ok(resolution))) => (device_id, resolution),
            Ok((_, Err(e))) => {
                warn!(conn_id = ctx.conn_id, error = %e, "terminal connect failed");
                ctx.client.send(ServerMessage::error(e.to_string()));
                return;
            }
            Err(e) => {
                warn!(conn_id = ctx.conn_id, error = %e, "terminal connect task failed");
                ctx.client.send(ServerMessage::error("terminal connect failed"));
                return;
            }
        };
        info!(
            conn_id = ctx.conn_id,
            session_id = %resolution.session_id,
            device_id = %device_id,
            resumed = resolution.is_resumed,
            "terminal bound"
        );
        ctx.bound = Some(resolution.session_id.clone());
        ctx.client.send(ServerMessage::TerminalSessionInfo {
            session_id: resolution.session_id,
            device_id,
            is_resumed: resolution.is_resumed,
            session_name: resolution.session_name,
        });
    }
}
