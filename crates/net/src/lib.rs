//! Huddle Network Library
//!
//! A multi-room TCP chat server and the matching client.
//!
//! # Architecture
//!
//! - **Codec**: 16-byte binary header followed by a JSON payload
//! - **Session**: one per connection; a read task and a writer task
//! - **Registry** / **Rooms**: who is online and who is in which room
//! - **Dispatcher**: per-connection protocol state machine
//! - **Server**: accepts connections and bounds how many are live
//! - **Client**: connects to a server
//!
//! # Usage
//!
//! ```ignore
//! let server = Server::start(ServerConfig::default()).await?;
//!
//! let mut client = Client::connect(server.addr()).await?;
//! client.join("alice").await?;
//! client.say("hello").await?;
//!
//! while let Some(message) = client.next_message().await {
//!     match message {
//!         Message::Broadcast(chat) => { /* handle */ }
//!         _ => {}
//!     }
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;
pub mod session;

pub use client::{Client, ConnectionState};
pub use codec::FrameCodec;
pub use config::ServerConfig;
pub use error::{Error, Result};
pub use protocol::{ErrorCode, Message, MessageKind};
pub use server::Server;
pub use session::{ConnectionId, Session, SessionHandle};

/// Default port for Huddle servers
pub const DEFAULT_PORT: u16 = 8080;
