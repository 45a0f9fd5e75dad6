//! Protocol state machine
//!
//! Routes each decoded message according to what the sender is allowed to
//! do in its current state. Per-connection state lives in a [`Peer`] owned
//! by that connection's read task, so it is never shared.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::protocol::{ChatText, ErrorCode, Message, Presence, RoomList, RoomRef, UserList};
use crate::registry::Registry;
use crate::room::RoomManager;
use crate::session::SessionHandle;

/// Longest accepted user or room name, in characters
pub const MAX_NAME_LEN: usize = 32;

/// Where a connection stands in the protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated { name: String, room: Option<String> },
}

/// Dispatcher state for one connection
#[derive(Debug)]
pub struct Peer {
    session: SessionHandle,
    auth: AuthState,
}

impl Peer {
    pub fn new(session: SessionHandle) -> Self {
        Self {
            session,
            auth: AuthState::Unauthenticated,
        }
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn auth(&self) -> &AuthState {
        &self.auth
    }

    pub fn name(&self) -> Option<&str> {
        match &self.auth {
            AuthState::Authenticated { name, .. } => Some(name),
            AuthState::Unauthenticated => None,
        }
    }

    pub fn room(&self) -> Option<&str> {
        match &self.auth {
            AuthState::Authenticated { room, .. } => room.as_deref(),
            AuthState::Unauthenticated => None,
        }
    }

    fn set_room(&mut self, new_room: Option<String>) {
        if let AuthState::Authenticated { room, .. } = &mut self.auth {
            *room = new_room;
        }
    }
}

/// Check a user or room name: non-empty, bounded, printable, no whitespace
pub fn validate_name(what: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Protocol(format!("empty {} name", what)));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(Error::Protocol(format!(
            "{} name longer than {} characters",
            what, MAX_NAME_LEN
        )));
    }
    if name.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(Error::Protocol(format!("invalid {} name: {:?}", what, name)));
    }
    Ok(())
}

fn not_authenticated(what: &str) -> Error {
    Error::Protocol(format!("{} before Join", what))
}

/// Shared message router
pub struct Dispatcher {
    registry: Arc<Registry>,
    rooms: Arc<RoomManager>,
    default_room: Option<String>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        rooms: Arc<RoomManager>,
        default_room: Option<String>,
    ) -> Self {
        Self {
            registry,
            rooms,
            default_room,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    /// Handle one message from `peer`.
    ///
    /// An `Err` means the connection must be closed; recoverable problems
    /// are answered with an `Error` reply and return `Ok`.
    pub async fn handle(&self, peer: &mut Peer, msg: Message) -> Result<()> {
        match msg {
            Message::Join(Presence { sender, .. }) => self.on_join(peer, sender).await,
            Message::Leave(_) => {
                debug!(conn_id = %peer.session.id(), "Client quit");
                peer.session.close();
                Ok(())
            }
            Message::RoomJoin(RoomRef { room }) => self.on_room_join(peer, room).await,
            Message::RoomLeave(RoomRef { room }) => self.on_room_leave(peer, room).await,
            Message::Broadcast(chat) => self.on_broadcast(peer, chat.content).await,
            Message::Private(chat) => self.on_private(peer, chat).await,
            Message::UserListRequest => {
                let users = self.registry.user_names().await;
                self.reply(peer, &Message::UserList(UserList { users }))
            }
            Message::RoomListRequest => {
                let rooms = self.rooms.list().await;
                self.reply(peer, &Message::RoomList(RoomList { rooms }))
            }
            Message::Heartbeat(_) => self.reply(peer, &Message::heartbeat()),
            Message::Error(_) | Message::UserList(_) | Message::RoomList(_) => Err(
                Error::Protocol(format!("{:?} may only be sent by the server", msg.kind())),
            ),
        }
    }

    /// Leave the current room and drop out of the registry
    pub async fn disconnect(&self, peer: &Peer) {
        let id = peer.session.id();
        if let Some(room) = peer.room() {
            if let Err(e) = self.rooms.leave(room, id).await {
                debug!(conn_id = %id, error = %e, "Failed to announce departure");
            }
        }
        self.registry.unregister(id).await;

        if let Some(name) = peer.name() {
            info!(conn_id = %id, user = %name, "User disconnected");
        }
    }

    /// Queue a reply on the sender's own session. A sender that is already
    /// closing just misses it.
    fn reply(&self, peer: &Peer, msg: &Message) -> Result<()> {
        match peer.session.send_message(msg) {
            Err(e) if !e.is_fatal() => {
                debug!(conn_id = %peer.session.id(), error = %e, "Reply dropped");
                Ok(())
            }
            other => other,
        }
    }

    async fn on_join(&self, peer: &mut Peer, name: String) -> Result<()> {
        if peer.name().is_some() {
            debug!(conn_id = %peer.session.id(), "Ignoring repeated Join");
            return Ok(());
        }
        validate_name("user", &name)?;

        let id = peer.session.id();
        match self.registry.bind_name(id, &name).await {
            Ok(()) => {}
            Err(Error::NameTaken(name)) => {
                debug!(conn_id = %id, user = %name, "Name already in use");
                return self.reply(
                    peer,
                    &Message::error(ErrorCode::NameTaken, format!("{} is already in use", name)),
                );
            }
            Err(e) => return Err(e),
        }

        info!(conn_id = %id, user = %name, addr = %peer.session.peer_addr(), "User joined");
        peer.auth = AuthState::Authenticated {
            name: name.clone(),
            room: None,
        };

        // Echo the Join back as the acknowledgment
        self.reply(
            peer,
            &Message::Join(Presence {
                sender: name,
                room: None,
                timestamp: Utc::now(),
            }),
        )?;

        if let Some(room) = self.default_room.clone() {
            self.enter_room(peer, room).await?;
        }

        let rooms = self.rooms.list().await;
        self.reply(peer, &Message::RoomList(RoomList { rooms }))
    }

    async fn on_room_join(&self, peer: &mut Peer, room: String) -> Result<()> {
        if peer.name().is_none() {
            return Err(not_authenticated("RoomJoin"));
        }
        validate_name("room", &room)?;

        if peer.room() == Some(room.as_str()) {
            return self.reply(peer, &Message::room_join(room));
        }
        self.enter_room(peer, room).await
    }

    async fn on_room_leave(&self, peer: &mut Peer, room: String) -> Result<()> {
        if peer.name().is_none() {
            return Err(not_authenticated("RoomLeave"));
        }
        if peer.room() != Some(room.as_str()) {
            return Err(Error::Protocol(format!("not a member of room {}", room)));
        }

        self.rooms.leave(&room, peer.session.id()).await?;
        peer.set_room(None);
        self.reply(peer, &Message::room_leave(room))
    }

    /// Move `peer` from its current room (if any) into `room`.
    ///
    /// The mover gets its `RoomJoin` echoed back as confirmation, ahead of
    /// the history replay.
    async fn enter_room(&self, peer: &mut Peer, room: String) -> Result<()> {
        let id = peer.session.id();
        if let Some(current) = peer.room() {
            self.rooms.leave(current, id).await?;
        }
        peer.set_room(None);

        let name = peer.name().unwrap_or_default().to_string();
        self.reply(peer, &Message::room_join(room.as_str()))?;
        self.rooms.join(&room, &peer.session, &name).await?;
        peer.set_room(Some(room));
        Ok(())
    }

    async fn on_broadcast(&self, peer: &Peer, content: String) -> Result<()> {
        let Some(name) = peer.name() else {
            return Err(not_authenticated("Broadcast"));
        };
        let Some(room) = peer.room() else {
            return Err(Error::Protocol("Broadcast outside of any room".into()));
        };

        let message = Message::Broadcast(ChatText {
            sender: name.to_string(),
            receiver: Some(room.to_string()),
            content,
            timestamp: Utc::now(),
        });
        self.rooms.broadcast(room, message).await?;
        Ok(())
    }

    async fn on_private(&self, peer: &Peer, chat: ChatText) -> Result<()> {
        let Some(name) = peer.name() else {
            return Err(not_authenticated("Private"));
        };
        let Some(target) = chat.receiver else {
            return Err(Error::Protocol("Private without a receiver".into()));
        };

        let message = Message::Private(ChatText {
            sender: name.to_string(),
            receiver: Some(target.clone()),
            content: chat.content,
            timestamp: Utc::now(),
        });

        let delivered = match self.registry.lookup_by_name(&target).await {
            Some(recipient) => recipient.send_message(&message).is_ok(),
            None => false,
        };

        if !delivered {
            debug!(conn_id = %peer.session.id(), target = %target, "Private message target not found");
            let lookup = Error::UserNotFound(target);
            return self.reply(peer, &Message::error(ErrorCode::UserNotFound, lookup.to_string()));
        }

        // Confirmation copy, unless the sender just messaged itself
        if name != target {
            self.reply(peer, &message)?;
        }
        Ok(())
    }
}
