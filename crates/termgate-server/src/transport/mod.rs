//! Client-facing transports.

pub mod websocket;
