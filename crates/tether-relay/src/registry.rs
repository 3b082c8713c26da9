//! Shared `UserId → ServerInstanceId` registry.
//!
//! Every process reads it to find where a user's agent socket lives. Only the
//! process holding the socket writes the entry, and it removes the entry with
//! compare-and-delete so a slow teardown can never erase a newer registration
//! made by another process.

use async_trait::async_trait;
use dashmap::DashMap;
use tether_core::{RelayError, ServerInstanceId, UserId};

/// Cross-process view of which instance owns each user's session.
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    /// Upsert the owner for `user_id`. Last writer wins.
    ///
    /// Returns the previous owner, if any.
    async fn register(
        &self,
        user_id: &UserId,
        owner: &ServerInstanceId,
    ) -> Result<Option<ServerInstanceId>, RelayError>;

    /// Current owner for `user_id`.
    async fn lookup(&self, user_id: &UserId) -> Result<Option<ServerInstanceId>, RelayError>;

    /// Remove the entry only if it is still owned by `owner`.
    ///
    /// Returns `true` if an entry was removed.
    async fn unregister(
        &self,
        user_id: &UserId,
        owner: &ServerInstanceId,
    ) -> Result<bool, RelayError>;

    /// Extend `owner`'s claim on `user_id` on backends that expire entries.
    ///
    /// Returns `false` when the entry is gone or names another instance.
    async fn refresh(
        &self,
        user_id: &UserId,
        owner: &ServerInstanceId,
    ) -> Result<bool, RelayError> {
        Ok(self.lookup(user_id).await?.as_ref() == Some(owner))
    }

    /// Whether any instance currently holds a session for `user_id`.
    async fn is_connected(&self, user_id: &UserId) -> Result<bool, RelayError> {
        Ok(self.lookup(user_id).await?.is_some())
    }
}

/// In-process registry.
///
/// Serves single-process deployments, and several [`Relay`](crate::Relay)s in
/// one process can share it to behave like separate instances.
#[derive(Default)]
pub struct MemoryRegistry {
    entries: DashMap<UserId, ServerInstanceId>,
}

impl MemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered users.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl AgentRegistry for MemoryRegistry {
    async fn register(
        &self,
        user_id: &UserId,
        owner: &ServerInstanceId,
    ) -> Result<Option<ServerInstanceId>, RelayError> {
        Ok(self.entries.insert(user_id.clone(), owner.clone()))
    }

    async fn lookup(&self, user_id: &UserId) -> Result<Option<ServerInstanceId>, RelayError> {
        Ok(self.entries.get(user_id).map(|entry| entry.value().clone()))
    }

    async fn unregister(
        &self,
        user_id: &UserId,
        owner: &ServerInstanceId,
    ) -> Result<bool, RelayError> {
        Ok(self
            .entries
            .remove_if(user_id, |_, current| current == owner)
            .is_some())
    }
}
