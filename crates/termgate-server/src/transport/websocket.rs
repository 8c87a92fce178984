//! WebSocket listener using tokio-tungstenite.
//!
//! Browser clients speak JSON text frames. The listener accepts TCP
//! connections, performs the WebSocket upgrade, and hands finished streams to
//! the server loop over a channel.

use std::net::SocketAddr;
use termgate_core::{GateError, GateResult, ServerMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Maximum accepted text frame (1 MiB).
pub const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    pub remote_addr: SocketAddr,
}

/// Start the WebSocket listener.
///
/// Returns the bound address and a receiver that yields accepted connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
) -> GateResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| GateError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener
        .local_addr()
        .map_err(|e| GateError::Transport(format!("WS local addr: {e}")))?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
            if tx.is_closed() {
                debug!("WebSocket listener stopped");
                break;
            }
        }
    });

    Ok((local_addr, rx))
}

/// What a received frame means to the gateway.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Ping(Vec<u8>),
    Pong,
    Close,
    /// Binary or raw frames; the protocol is text only.
    Unsupported,
}

/// Classify one received frame. Oversized text frames are rejected.
pub fn classify(msg: Message) -> GateResult<Inbound> {
    match msg {
        Message::Text(text) => {
            if text.len() > MAX_WS_FRAME_SIZE {
                return Err(GateError::InvalidMessage(format!(
                    "WS frame too large: {} bytes (max {})",
                    text.len(),
                    MAX_WS_FRAME_SIZE
                )));
            }
            Ok(Inbound::Text(text.to_string()))
        }
        Message::Ping(payload) => Ok(Inbound::Ping(payload.to_vec())),
        Message::Pong(_) => Ok(Inbound::Pong),
        Message::Close(_) => Ok(Inbound::Close),
        Message::Binary(_) | Message::Frame(_) => Ok(Inbound::Unsupported),
    }
}

/// Encode a protocol message as a text frame.
pub fn text_frame(msg: &ServerMessage) -> GateResult<Message> {
    Ok(Message::Text(msg.to_json()?.into()))
}

pub fn ping_frame() -> Message {
    Message::Ping(Vec::new().into())
}

pub fn pong_frame(payload: Vec<u8>) -> Message {
    Message::Pong(payload.into())
}
