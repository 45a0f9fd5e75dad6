//! Server configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::room::DEFAULT_HISTORY_CAPACITY;
use crate::session::SessionSettings;
use crate::DEFAULT_PORT;

/// Listener and session settings.
///
/// Every field has a default, so a partial TOML table is enough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Connections beyond this are refused with `ServerFull`
    pub max_connections: usize,
    /// Seconds without any inbound bytes before a session is closed; 0 disables
    pub idle_timeout_secs: u64,
    /// Milliseconds queued frames may keep flushing after close
    pub close_linger_ms: u64,
    pub max_frame_size: usize,
    /// Per-session outbound queue depth on top of room history replay
    pub outbound_queue: usize,
    /// Broadcasts remembered per room
    pub history_capacity: usize,
    /// Room every user enters on Join; empty disables
    pub default_room: String,
    /// Rooms that exist from startup
    pub initial_rooms: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            max_connections: 1000,
            idle_timeout_secs: 300,
            close_linger_ms: 500,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            outbound_queue: 256,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            default_room: "lobby".to_string(),
            initial_rooms: vec!["lobby".to_string()],
        }
    }
}

impl ServerConfig {
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout_secs = timeout.map_or(0, |t| t.as_secs().max(1));
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn with_default_room(mut self, room: Option<&str>) -> Self {
        self.default_room = room.unwrap_or_default().to_string();
        self
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn close_linger(&self) -> Duration {
        Duration::from_millis(self.close_linger_ms)
    }

    pub fn default_room(&self) -> Option<&str> {
        (!self.default_room.is_empty()).then_some(self.default_room.as_str())
    }

    /// A joiner is sent the whole room history in one go, before its
    /// writer gets to run, so every queue has room for that on top of
    /// `outbound_queue`.
    pub fn session_queue_capacity(&self) -> usize {
        self.outbound_queue.saturating_add(self.history_capacity)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            idle_timeout: self.idle_timeout(),
            close_linger: self.close_linger(),
            max_frame_size: self.max_frame_size,
            outbound_queue: self.session_queue_capacity(),
        }
    }
}
