use std::time::Duration;
use thiserror::Error;

/// Errors produced by the terminal bridge.
///
/// The first five variants are the connect-attempt taxonomy: each one is
/// fatal to the attempt and reported to the client as an `error` message.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("connect timed out after {}s", .0.as_secs())]
    ConnectTimeout(Duration),

    #[error("shell error: {0}")]
    Shell(String),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("private key decryption failed: {0}")]
    KeyDecryption(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl GateError {
    /// Whether this error belongs to the connect-attempt taxonomy.
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            GateError::Auth(_)
                | GateError::ConnectTimeout(_)
                | GateError::Shell(_)
                | GateError::DeviceUnavailable(_)
                | GateError::KeyDecryption(_)
        )
    }
}

impl From<serde_json::Error> for GateError {
    fn from(e: serde_json::Error) -> Self {
        GateError::InvalidMessage(e.to_string())
    }
}

pub type GateResult<T> = Result<T, GateError>;
