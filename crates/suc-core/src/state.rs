//! Protocol engine states.

use std::fmt;

/// Where the engine is in the upload-mode session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineState {
    /// No handshake yet.
    #[default]
    Disconnected,
    /// `PrEaMbLe` sent, waiting for the acknowledgment.
    Handshaking,
    /// Idle, accepting commands.
    Ready,
    /// `PrObE` in flight.
    Probing,
    /// Range setup or streaming in flight.
    Downloading,
    /// Handshake answered with something other than the acknowledgment.
    ProtocolMismatch,
    /// Postamble sent and transport released.
    Closed,
}

impl EngineState {
    /// Check if commands can be issued.
    pub fn is_ready(&self) -> bool {
        matches!(self, EngineState::Ready)
    }

    /// Check if the session can no longer be used.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::ProtocolMismatch | EngineState::Closed)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Disconnected => write!(f, "DISCONNECTED"),
            EngineState::Handshaking => write!(f, "HANDSHAKING"),
            EngineState::Ready => write!(f, "READY"),
            EngineState::Probing => write!(f, "PROBING"),
            EngineState::Downloading => write!(f, "DOWNLOADING"),
            EngineState::ProtocolMismatch => write!(f, "PROTOCOL_MISMATCH"),
            EngineState::Closed => write!(f, "CLOSED"),
        }
    }
}
