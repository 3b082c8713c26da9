//! Process-local table of live agent sessions.
//!
//! Only the process holding a socket ever touches its entry. Other processes
//! learn about it through the [`AgentRegistry`](crate::registry::AgentRegistry).

use std::sync::Arc;

use dashmap::DashMap;
use tether_core::{ConnectionId, UserId};

use crate::session::AgentSession;

/// `UserId → AgentSession` with per-key locking.
#[derive(Default)]
pub struct SessionTable {
    sessions: DashMap<UserId, Arc<AgentSession>>,
}

impl SessionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, returning the one it replaced.
    pub fn insert(&self, session: Arc<AgentSession>) -> Option<Arc<AgentSession>> {
        self.sessions.insert(session.user_id().clone(), session)
    }

    /// Live session for a user.
    pub fn get(&self, user_id: &UserId) -> Option<Arc<AgentSession>> {
        self.sessions.get(user_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove the user's entry only if it still belongs to `connection_id`.
    ///
    /// Returns `true` if an entry was removed.
    pub fn remove_if_current(&self, user_id: &UserId, connection_id: &ConnectionId) -> bool {
        self.sessions
            .remove_if(user_id, |_, session| session.connection_id() == connection_id)
            .is_some()
    }

    /// Every live session.
    pub fn all(&self) -> Vec<Arc<AgentSession>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Users with a live session here, sorted.
    pub fn user_ids(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
