//! termgate-core: shared library for the terminal bridge.
//!
//! Provides the JSON protocol messages exchanged with browser clients, the
//! error taxonomy, and the terminal emulator that turns a raw output stream
//! into significant history frames.

pub mod emulator;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use emulator::{FrameKind, TerminalEmulator, TerminalFrame};
pub use error::{GateError, GateResult};
pub use messages::{ClientMessage, DeviceStatus, ServerMessage};
