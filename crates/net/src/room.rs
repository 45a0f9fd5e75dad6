//! Room management
//!
//! Rooms are named broadcast groups with a bounded history. A room only
//! holds weak references to its members; the registry owns sessions.
//! Each room has its own lock so joins, leaves and broadcasts on one room
//! never interleave, while different rooms proceed independently.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::codec::Outbound;
use crate::error::{Error, Result};
use crate::protocol::{Message, Presence, RoomInfo};
use crate::session::{ConnectionId, Session, SessionHandle};

/// Messages kept per room unless configured otherwise
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

struct Member {
    name: String,
    session: Weak<Session>,
}

#[derive(Default)]
struct RoomState {
    members: HashMap<ConnectionId, Member>,
    history: VecDeque<Message>,
}

impl RoomState {
    /// Queue `message` on every member except `except`.
    ///
    /// Members that are closing are skipped; members whose session is gone
    /// are pruned. Returns how many sessions accepted the frame.
    fn fan_out(&mut self, message: &Message, except: Option<ConnectionId>) -> Result<usize> {
        let frame = Outbound::from_message(message)?;
        let mut delivered = 0;
        let mut gone = Vec::new();

        for (id, member) in &self.members {
            if except == Some(*id) {
                continue;
            }
            match member.session.upgrade() {
                Some(session) => {
                    if session.send(frame.clone()).is_ok() {
                        delivered += 1;
                    }
                }
                None => gone.push(*id),
            }
        }

        for id in gone {
            self.members.remove(&id);
        }
        Ok(delivered)
    }
}

/// A chat room
pub struct Room {
    name: String,
    history_capacity: usize,
    state: Mutex<RoomState>,
}

impl Room {
    fn new(name: String, history_capacity: usize) -> Self {
        Self {
            name,
            history_capacity,
            state: Mutex::new(RoomState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn member_count(&self) -> usize {
        self.state.lock().await.members.len()
    }

    pub async fn member_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state.members.values().map(|m| m.name.clone()).collect();
        names.sort();
        names
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.state.lock().await.members.contains_key(&id)
    }

    /// Past broadcasts, oldest first
    pub async fn history(&self) -> Vec<Message> {
        self.state.lock().await.history.iter().cloned().collect()
    }

    async fn add(&self, session: &SessionHandle, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.members.insert(
            session.id(),
            Member {
                name: name.to_string(),
                session: Arc::downgrade(session),
            },
        );

        // Replay before anyone else can broadcast to the newcomer
        for past in &state.history {
            if session.send_message(past).is_err() {
                break;
            }
        }

        let notice = Message::Join(Presence {
            sender: name.to_string(),
            room: Some(self.name.clone()),
            timestamp: Utc::now(),
        });
        state.fan_out(&notice, Some(session.id()))?;
        Ok(())
    }

    async fn remove(&self, id: ConnectionId) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(member) = state.members.remove(&id) else {
            return Ok(false);
        };

        let notice = Message::Leave(Presence {
            sender: member.name,
            room: Some(self.name.clone()),
            timestamp: Utc::now(),
        });
        state.fan_out(&notice, None)?;
        Ok(true)
    }

    async fn broadcast(&self, message: Message) -> Result<usize> {
        let mut state = self.state.lock().await;
        if self.history_capacity > 0 {
            state.history.push_back(message.clone());
            while state.history.len() > self.history_capacity {
                state.history.pop_front();
            }
        }
        state.fan_out(&message, None)
    }
}

/// All rooms known to the server.
///
/// Rooms are created on first reference and kept when they empty out.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    history_capacity: usize,
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl RoomManager {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            history_capacity,
        }
    }

    /// Get a room, creating it if needed
    pub async fn ensure(&self, name: &str) -> Arc<Room> {
        if let Some(room) = self.rooms.read().await.get(name) {
            return room.clone();
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(room = %name, "Room created");
                Arc::new(Room::new(name.to_string(), self.history_capacity))
            })
            .clone()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    /// Add `session` to `room` as `name`: replay history to it, then tell
    /// the other members.
    pub async fn join(&self, room: &str, session: &SessionHandle, name: &str) -> Result<()> {
        let target = self.ensure(room).await;
        target.add(session, name).await?;
        debug!(conn_id = %session.id(), room = %room, user = %name, "Joined room");
        Ok(())
    }

    /// Remove a member and tell the rest. Returns false if it was not there.
    pub async fn leave(&self, room: &str, id: ConnectionId) -> Result<bool> {
        let Some(target) = self.get(room).await else {
            return Ok(false);
        };
        let removed = target.remove(id).await?;
        if removed {
            debug!(conn_id = %id, room = %room, "Left room");
        }
        Ok(removed)
    }

    /// Record `message` in the room history and deliver it to every member
    pub async fn broadcast(&self, room: &str, message: Message) -> Result<usize> {
        let target = self
            .get(room)
            .await
            .ok_or_else(|| Error::RoomNotFound(room.to_string()))?;
        target.broadcast(message).await
    }

    /// Every room with its member count, sorted by name
    pub async fn list(&self) -> Vec<RoomInfo> {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();

        let mut infos = Vec::with_capacity(rooms.len());
        for room in rooms {
            infos.push(RoomInfo {
                name: room.name().to_string(),
                members: room.member_count().await,
            });
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub async fn members(&self, room: &str) -> Vec<String> {
        match self.get(room).await {
            Some(room) => room.member_names().await,
            None => Vec::new(),
        }
    }

    pub async fn history(&self, room: &str) -> Vec<Message> {
        match self.get(room).await {
            Some(room) => room.history().await,
            None => Vec::new(),
        }
    }

    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Outbound;
    use crate::protocol::ChatText;
    use crate::session::test_session;
    use tokio::sync::mpsc;

    fn chat(sender: &str, room: &str, content: &str) -> Message {
        Message::Broadcast(ChatText {
            sender: sender.to_string(),
            receiver: Some(room.to_string()),
            content: content.to_string(),
            timestamp: Utc::now(),
        })
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(Message::from_payload(frame.kind, &frame.payload).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_join_notifies_others_not_joiner() {
        let rooms = RoomManager::default();
        let (alice, mut alice_rx) = test_session(1, 64);
        let (bob, mut bob_rx) = test_session(2, 64);

        rooms.join("lobby", &alice, "alice").await.unwrap();
        rooms.join("lobby", &bob, "bob").await.unwrap();

        assert!(drain(&mut bob_rx).is_empty());
        let seen = drain(&mut alice_rx);
        assert_eq!(seen.len(), 1);
        match &seen[0] {
            Message::Join(p) => {
                assert_eq!(p.sender, "bob");
                assert_eq!(p.room.as_deref(), Some("lobby"));
            }
            other => panic!("expected Join, got {:?}", other),
        }
        assert_eq!(rooms.members("lobby").await, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_history_replayed_in_order() {
        let rooms = RoomManager::default();
        let (alice, _alice_rx) = test_session(1, 256);
        rooms.join("lobby", &alice, "alice").await.unwrap();
        for i in 0..5 {
            rooms
                .broadcast("lobby", chat("alice", "lobby", &format!("m{}", i)))
                .await
                .unwrap();
        }

        let (bob, mut bob_rx) = test_session(2, 256);
        rooms.join("lobby", &bob, "bob").await.unwrap();
        rooms
            .broadcast("lobby", chat("alice", "lobby", "fresh"))
            .await
            .unwrap();

        let contents: Vec<String> = drain(&mut bob_rx)
            .into_iter()
            .map(|m| match m {
                Message::Broadcast(c) => c.content,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4", "fresh"]);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let rooms = RoomManager::new(3);
        let (alice, _rx) = test_session(1, 64);
        rooms.join("lobby", &alice, "alice").await.unwrap();
        for i in 0..10 {
            rooms
                .broadcast("lobby", chat("alice", "lobby", &i.to_string()))
                .await
                .unwrap();
        }

        let kept: Vec<String> = rooms
            .history("lobby")
            .await
            .into_iter()
            .map(|m| match m {
                Message::Broadcast(c) => c.content,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(kept, vec!["7", "8", "9"]);
    }

    #[tokio::test]
    async fn test_leave_notifies_remaining() {
        let rooms = RoomManager::default();
        let (alice, _a) = test_session(1, 64);
        let (bob, mut bob_rx) = test_session(2, 64);
        rooms.join("lobby", &alice, "alice").await.unwrap();
        rooms.join("lobby", &bob, "bob").await.unwrap();

        assert!(rooms.leave("lobby", alice.id()).await.unwrap());
        assert!(!rooms.leave("lobby", alice.id()).await.unwrap());
        assert!(!rooms.leave("nowhere", alice.id()).await.unwrap());

        let seen = drain(&mut bob_rx);
        assert!(matches!(&seen[..], [Message::Leave(p)] if p.sender == "alice"));
    }

    #[tokio::test]
    async fn test_broadcast_skips_closed_and_dropped_members() {
        let rooms = RoomManager::default();
        let (alice, mut alice_rx) = test_session(1, 64);
        let (bob, _bob_rx) = test_session(2, 64);
        let (carol, _carol_rx) = test_session(3, 64);
        rooms.join("lobby", &alice, "alice").await.unwrap();
        rooms.join("lobby", &bob, "bob").await.unwrap();
        rooms.join("lobby", &carol, "carol").await.unwrap();
        drain(&mut alice_rx);

        bob.close();
        drop(carol);

        let delivered = rooms
            .broadcast("lobby", chat("alice", "lobby", "anyone?"))
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(drain(&mut alice_rx).len(), 1);
        // Dropped session pruned, closing one left for its own teardown
        assert_eq!(rooms.members("lobby").await, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_broadcast_to_unknown_room() {
        let rooms = RoomManager::default();
        let result = rooms.broadcast("void", chat("a", "void", "x")).await;
        assert!(matches!(result, Err(Error::RoomNotFound(_))));
    }

    #[tokio::test]
    async fn test_empty_rooms_are_kept() {
        let rooms = RoomManager::default();
        let (alice, _rx) = test_session(1, 64);
        rooms.join("den", &alice, "alice").await.unwrap();
        rooms.leave("den", alice.id()).await.unwrap();
        rooms.ensure("attic").await;

        let listed = rooms.list().await;
        assert_eq!(
            listed,
            vec![
                RoomInfo {
                    name: "attic".into(),
                    members: 0
                },
                RoomInfo {
                    name: "den".into(),
                    members: 0
                },
            ]
        );
    }
}
