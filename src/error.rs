//! Simulator error surface
//!
//! Malformed frames and transport failures close the connection; the other
//! kinds are answered on the wire with CMD_ACK_ERROR and the session
//! continues.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimulatorError {
    /// Bad stream-envelope magic or a truncated packet header
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// Command code the dispatcher does not recognize
    #[error("unknown command {0}")]
    UnknownCommand(u16),

    /// Payload size does not match any layout the command accepts
    #[error("bad payload for command {command}: expected {expected}, got {got} bytes")]
    BadPayload {
        command: u16,
        expected: &'static str,
        got: usize,
    },

    /// Template lookup miss
    #[error("no template for uid={uid} finger={finger}")]
    TemplateNotFound { uid: u16, finger: u8 },

    /// Socket-level failure; the session is torn down
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl SimulatorError {
    /// Whether the error is answered with an ERROR ack instead of closing
    /// the connection
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::UnknownCommand(_) | Self::BadPayload { .. } | Self::TemplateNotFound { .. }
        )
    }
}
