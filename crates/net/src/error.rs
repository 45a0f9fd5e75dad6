//! Network error types

use std::io;

use crate::session::ConnectionId;

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Idle timeout")]
    IdleTimeout,

    #[error("Bad frame magic: {0:#010x}")]
    Framing(u32),

    #[error("Frame length {0} is shorter than the header")]
    TruncatedFrame(u32),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("Frame too large: {size} bytes (max {max})")]
    OversizedFrame { size: usize, max: usize },

    #[error("Unknown message kind: {0:#06x}")]
    UnknownMessageKind(u16),

    #[error("Invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Name already taken: {0}")]
    NameTaken(String),

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Outbound queue full for connection {0}")]
    Backpressure(ConnectionId),

    #[error("Session {0} is closed")]
    SessionClosed(ConnectionId),

    #[error("Not connected")]
    NotConnected,
}

impl Error {
    /// Peer went away or stopped talking; not worth more than a debug line.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::ConnectionClosed | Error::IdleTimeout
        )
    }

    /// Errors that end the connection they occurred on.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::UserNotFound(_)
                | Error::NameTaken(_)
                | Error::Backpressure(_)
                | Error::SessionClosed(_)
        )
    }
}
