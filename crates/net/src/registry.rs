//! Connection registry
//!
//! Maps connection ids to live session handles, and display names to
//! connection ids. One lock guards both maps so a name can never point at a
//! session that has already been unregistered.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::session::{ConnectionId, SessionHandle};

struct Entry {
    session: SessionHandle,
    name: Option<String>,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<ConnectionId, Entry>,
    names: HashMap<String, ConnectionId>,
}

/// Lookup table for every Active or Closing session
#[derive(Default)]
pub struct Registry {
    state: RwLock<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a freshly accepted session
    pub async fn register(&self, session: SessionHandle) {
        let id = session.id();
        let mut state = self.state.write().await;
        let previous = state.entries.insert(
            id,
            Entry {
                session,
                name: None,
            },
        );
        assert!(previous.is_none(), "connection id {} registered twice", id);
        debug!(conn_id = %id, "Session registered");
    }

    /// Remove a session and release its name
    pub async fn unregister(&self, id: ConnectionId) -> Option<SessionHandle> {
        let mut state = self.state.write().await;
        let entry = state.entries.remove(&id)?;
        if let Some(name) = &entry.name {
            state.names.remove(name);
        }
        debug!(conn_id = %id, "Session unregistered");
        Some(entry.session)
    }

    /// Attach a display name to a registered session
    pub async fn bind_name(&self, id: ConnectionId, name: &str) -> Result<()> {
        let mut state = self.state.write().await;

        match state.names.get(name) {
            Some(owner) if *owner == id => return Ok(()),
            Some(_) => return Err(Error::NameTaken(name.to_string())),
            None => {}
        }

        let entry = state
            .entries
            .get_mut(&id)
            .ok_or(Error::SessionClosed(id))?;
        let previous = entry.name.replace(name.to_string());

        if let Some(previous) = previous {
            state.names.remove(&previous);
        }
        state.names.insert(name.to_string(), id);
        Ok(())
    }

    pub async fn lookup_by_id(&self, id: ConnectionId) -> Option<SessionHandle> {
        let state = self.state.read().await;
        state.entries.get(&id).map(|e| e.session.clone())
    }

    pub async fn lookup_by_name(&self, name: &str) -> Option<SessionHandle> {
        let state = self.state.read().await;
        let id = state.names.get(name)?;
        state.entries.get(id).map(|e| e.session.clone())
    }

    pub async fn name_of(&self, id: ConnectionId) -> Option<String> {
        let state = self.state.read().await;
        state.entries.get(&id).and_then(|e| e.name.clone())
    }

    /// Handles to every registered session
    pub async fn snapshot_all(&self) -> Vec<SessionHandle> {
        let state = self.state.read().await;
        state.entries.values().map(|e| e.session.clone()).collect()
    }

    /// Sorted names of every authenticated session
    pub async fn user_names(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut names: Vec<String> = state.names.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_session;

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = Registry::new();
        let (alice, _rx) = test_session(1, 8);
        registry.register(alice.clone()).await;
        registry.bind_name(alice.id(), "alice").await.unwrap();

        let by_id = registry.lookup_by_id(alice.id()).await.unwrap();
        let by_name = registry.lookup_by_name("alice").await.unwrap();
        assert_eq!(by_id.id(), alice.id());
        assert_eq!(by_name.id(), alice.id());
        assert_eq!(registry.name_of(alice.id()).await.as_deref(), Some("alice"));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let registry = Registry::new();
        let (alice, _a) = test_session(1, 8);
        let (imposter, _b) = test_session(2, 8);
        registry.register(alice.clone()).await;
        registry.register(imposter.clone()).await;

        registry.bind_name(alice.id(), "alice").await.unwrap();
        let result = registry.bind_name(imposter.id(), "alice").await;
        assert!(matches!(result, Err(Error::NameTaken(_))));

        // Rebinding your own name is fine
        registry.bind_name(alice.id(), "alice").await.unwrap();
    }

    #[tokio::test]
    async fn test_unregister_frees_name() {
        let registry = Registry::new();
        let (alice, _a) = test_session(1, 8);
        registry.register(alice.clone()).await;
        registry.bind_name(alice.id(), "alice").await.unwrap();

        assert!(registry.unregister(alice.id()).await.is_some());
        assert!(registry.lookup_by_name("alice").await.is_none());
        assert!(registry.is_empty().await);
        assert!(registry.unregister(alice.id()).await.is_none());

        let (again, _b) = test_session(2, 8);
        registry.register(again.clone()).await;
        registry.bind_name(again.id(), "alice").await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_requires_registration() {
        let registry = Registry::new();
        let result = registry.bind_name(ConnectionId::new(99), "ghost").await;
        assert!(matches!(result, Err(Error::SessionClosed(_))));
    }

    #[tokio::test]
    async fn test_handle_outlives_unregister() {
        let registry = Registry::new();
        let (bob, _rx) = test_session(3, 8);
        registry.register(bob.clone()).await;
        registry.bind_name(bob.id(), "bob").await.unwrap();

        let handle = registry.lookup_by_name("bob").await.unwrap();
        registry.unregister(bob.id()).await;
        drop(bob);
        // The looked-up handle is still usable
        assert!(handle.is_active());
    }

    #[tokio::test]
    async fn test_user_names_sorted() {
        let registry = Registry::new();
        for (id, name) in [(1, "carol"), (2, "alice"), (3, "bob")] {
            let (session, _rx) = test_session(id, 8);
            registry.register(session.clone()).await;
            registry.bind_name(session.id(), name).await.unwrap();
        }
        let (anonymous, _rx) = test_session(4, 8);
        registry.register(anonymous).await;

        assert_eq!(registry.user_names().await, vec!["alice", "bob", "carol"]);
        assert_eq!(registry.snapshot_all().await.len(), 4);
    }
}
