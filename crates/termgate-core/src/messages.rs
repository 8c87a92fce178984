//! WebSocket protocol messages.
//!
//! Every frame is a JSON object with a kebab-case `type` tag and camelCase
//! fields. Client and server directions are separate closed unions; anything
//! that does not match a known `type` is rejected.

use crate::error::{GateError, GateResult};
use serde::{Deserialize, Serialize};

/// Reachability of a device as reported by the device directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Unknown,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Unknown => "unknown",
        }
    }
}

/// Messages sent by the browser client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Subscribe { device_id: String },
    #[serde(rename_all = "camelCase")]
    Unsubscribe { device_id: String },
    Ping,
    Pong,
    #[serde(rename_all = "camelCase")]
    TerminalConnect {
        device_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    TerminalData { data: String },
    TerminalResize { cols: u16, rows: u16 },
    TerminalDisconnect,
    TerminalTerminate,
}

impl ClientMessage {
    /// Parse a text frame. Unknown or missing `type` tags are errors.
    pub fn parse(text: &str) -> GateResult<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        match value.get("type") {
            Some(serde_json::Value::String(_)) => {}
            Some(_) => return Err(GateError::InvalidMessage("`type` must be a string".into())),
            None => return Err(GateError::InvalidMessage("missing `type`".into())),
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Subscribe { .. } => "subscribe",
            ClientMessage::Unsubscribe { .. } => "unsubscribe",
            ClientMessage::Ping => "ping",
            ClientMessage::Pong => "pong",
            ClientMessage::TerminalConnect { .. } => "terminal-connect",
            ClientMessage::TerminalData { .. } => "terminal-data",
            ClientMessage::TerminalResize { .. } => "terminal-resize",
            ClientMessage::TerminalDisconnect => "terminal-disconnect",
            ClientMessage::TerminalTerminate => "terminal-terminate",
        }
    }
}

/// Messages pushed to the browser client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Ping,
    Pong,
    Connect { message: String },
    Data { data: String },
    Error { message: String },
    Close { message: String },
    #[serde(rename_all = "camelCase")]
    TerminalSessionInfo {
        session_id: String,
        device_id: String,
        is_resumed: bool,
        session_name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    DeviceStatus {
        device_id: String,
        status: DeviceStatus,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn close(message: impl Into<String>) -> Self {
        ServerMessage::Close {
            message: message.into(),
        }
    }

    pub fn data(data: impl Into<String>) -> Self {
        ServerMessage::Data { data: data.into() }
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> GateResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
