//! Network protocol message types
//!
//! Every message has a numeric kind carried in the frame header and a
//! kind-specific JSON body carried as the frame payload. Kinds without a
//! body travel with an empty payload.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Message kind as it appears in the frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    // System (0x00xx)
    Heartbeat = 0x0001,
    Error = 0x0002,

    // Presence (0x01xx)
    Join = 0x0100,
    Leave = 0x0101,

    // Chat (0x02xx)
    Broadcast = 0x0200,
    Private = 0x0201,

    // Rooms (0x03xx)
    RoomJoin = 0x0300,
    RoomLeave = 0x0301,

    // Directory (0x04xx)
    UserListRequest = 0x0400,
    UserList = 0x0401,
    RoomListRequest = 0x0402,
    RoomList = 0x0403,
}

impl MessageKind {
    /// Convert from the wire code, returns None for unknown kinds
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(MessageKind::Heartbeat),
            0x0002 => Some(MessageKind::Error),
            0x0100 => Some(MessageKind::Join),
            0x0101 => Some(MessageKind::Leave),
            0x0200 => Some(MessageKind::Broadcast),
            0x0201 => Some(MessageKind::Private),
            0x0300 => Some(MessageKind::RoomJoin),
            0x0301 => Some(MessageKind::RoomLeave),
            0x0400 => Some(MessageKind::UserListRequest),
            0x0401 => Some(MessageKind::UserList),
            0x0402 => Some(MessageKind::RoomListRequest),
            0x0403 => Some(MessageKind::RoomList),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    /// Replies only the server may send
    pub fn is_server_only(self) -> bool {
        matches!(
            self,
            MessageKind::Error | MessageKind::UserList | MessageKind::RoomList
        )
    }
}

/// Someone entering or leaving; `room` is unset for the login handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Text addressed to a room (`Broadcast`) or a single user (`Private`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatText {
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRef {
    pub room: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp: DateTime<Utc>,
}

/// Why the server refused something
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UserNotFound,
    NameTaken,
    ServerFull,
    Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserList {
    pub users: Vec<String>,
}

/// A room and how many sessions are in it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub name: String,
    pub members: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomList {
    pub rooms: Vec<RoomInfo>,
}

/// Network protocol messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Keep-alive, answered with the server's clock
    Heartbeat(Heartbeat),
    /// Server refusal; `Protocol` and `ServerFull` are followed by a close
    Error(ErrorReply),
    /// Login request from a client, or a room arrival notice from the server
    Join(Presence),
    /// Quit from a client, or a room departure notice from the server
    Leave(Presence),
    /// Room text
    Broadcast(ChatText),
    /// Direct text to one user
    Private(ChatText),
    RoomJoin(RoomRef),
    RoomLeave(RoomRef),
    UserListRequest,
    UserList(UserList),
    RoomListRequest,
    RoomList(RoomList),
}

impl Message {
    pub fn heartbeat() -> Self {
        Message::Heartbeat(Heartbeat {
            timestamp: Utc::now(),
        })
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Message::Error(ErrorReply {
            code,
            message: message.into(),
        })
    }

    /// Login as `name`
    pub fn join(name: impl Into<String>) -> Self {
        Message::Join(Presence {
            sender: name.into(),
            room: None,
            timestamp: Utc::now(),
        })
    }

    /// Quit; the sender is filled in by the server
    pub fn leave() -> Self {
        Message::Leave(Presence {
            sender: String::new(),
            room: None,
            timestamp: Utc::now(),
        })
    }

    /// Text for the current room; the server stamps sender and room
    pub fn broadcast(content: impl Into<String>) -> Self {
        Message::Broadcast(ChatText {
            sender: String::new(),
            receiver: None,
            content: content.into(),
            timestamp: Utc::now(),
        })
    }

    pub fn private(target: impl Into<String>, content: impl Into<String>) -> Self {
        Message::Private(ChatText {
            sender: String::new(),
            receiver: Some(target.into()),
            content: content.into(),
            timestamp: Utc::now(),
        })
    }

    pub fn room_join(room: impl Into<String>) -> Self {
        Message::RoomJoin(RoomRef { room: room.into() })
    }

    pub fn room_leave(room: impl Into<String>) -> Self {
        Message::RoomLeave(RoomRef { room: room.into() })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Heartbeat(_) => MessageKind::Heartbeat,
            Message::Error(_) => MessageKind::Error,
            Message::Join(_) => MessageKind::Join,
            Message::Leave(_) => MessageKind::Leave,
            Message::Broadcast(_) => MessageKind::Broadcast,
            Message::Private(_) => MessageKind::Private,
            Message::RoomJoin(_) => MessageKind::RoomJoin,
            Message::RoomLeave(_) => MessageKind::RoomLeave,
            Message::UserListRequest => MessageKind::UserListRequest,
            Message::UserList(_) => MessageKind::UserList,
            Message::RoomListRequest => MessageKind::RoomListRequest,
            Message::RoomList(_) => MessageKind::RoomList,
        }
    }

    /// Serialize the message body to payload bytes
    pub fn to_payload(&self) -> Result<Bytes> {
        let json = match self {
            Message::Heartbeat(body) => serde_json::to_vec(body)?,
            Message::Error(body) => serde_json::to_vec(body)?,
            Message::Join(body) | Message::Leave(body) => serde_json::to_vec(body)?,
            Message::Broadcast(body) | Message::Private(body) => serde_json::to_vec(body)?,
            Message::RoomJoin(body) | Message::RoomLeave(body) => serde_json::to_vec(body)?,
            Message::UserList(body) => serde_json::to_vec(body)?,
            Message::RoomList(body) => serde_json::to_vec(body)?,
            Message::UserListRequest | Message::RoomListRequest => return Ok(Bytes::new()),
        };
        Ok(Bytes::from(json))
    }

    /// Deserialize a payload according to its header kind
    pub fn from_payload(kind: MessageKind, payload: &[u8]) -> Result<Self> {
        let msg = match kind {
            MessageKind::Heartbeat => Message::Heartbeat(serde_json::from_slice(payload)?),
            MessageKind::Error => Message::Error(serde_json::from_slice(payload)?),
            MessageKind::Join => Message::Join(serde_json::from_slice(payload)?),
            MessageKind::Leave => Message::Leave(serde_json::from_slice(payload)?),
            MessageKind::Broadcast => Message::Broadcast(serde_json::from_slice(payload)?),
            MessageKind::Private => Message::Private(serde_json::from_slice(payload)?),
            MessageKind::RoomJoin => Message::RoomJoin(serde_json::from_slice(payload)?),
            MessageKind::RoomLeave => Message::RoomLeave(serde_json::from_slice(payload)?),
            MessageKind::UserList => Message::UserList(serde_json::from_slice(payload)?),
            MessageKind::RoomList => Message::RoomList(serde_json::from_slice(payload)?),
            MessageKind::UserListRequest | MessageKind::RoomListRequest => {
                if !payload.is_empty() {
                    return Err(Error::Protocol(format!(
                        "{:?} carries a {} byte payload",
                        kind,
                        payload.len()
                    )));
                }
                if kind == MessageKind::UserListRequest {
                    Message::UserListRequest
                } else {
                    Message::RoomListRequest
                }
            }
        };
        Ok(msg)
    }
}
