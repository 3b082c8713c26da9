//! Agent credential lookup.
//!
//! Issuing and storing credentials is somebody else's job; the relay only
//! asks "what secret and platform belong to this user".

use std::collections::HashMap;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tether_core::UserId;
use tether_settings::AuthSettings;

/// One agent's connection credential.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentCredential {
    /// Shared secret the agent presents.
    pub secret: String,
    /// Platform label (e.g. `"macos"`).
    pub platform: String,
}

/// Source of agent credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Credential for `user_id`, if one exists.
    async fn credential(&self, user_id: &UserId) -> Option<AgentCredential>;

    /// Check a presented secret. Returns the agent's platform on success.
    ///
    /// Secrets are compared as SHA-256 digests so the comparison does not
    /// depend on where the strings first differ.
    async fn verify(&self, user_id: &UserId, secret: &str) -> Option<String> {
        let credential = self.credential(user_id).await?;
        let expected = Sha256::digest(credential.secret.as_bytes());
        let presented = Sha256::digest(secret.as_bytes());
        (expected == presented).then_some(credential.platform)
    }
}

/// Fixed credential set, typically loaded from settings.
#[derive(Clone, Debug, Default)]
pub struct StaticCredentialStore {
    agents: HashMap<UserId, AgentCredential>,
}

impl StaticCredentialStore {
    /// Empty store: every agent is rejected.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `auth.agents`.
    pub fn from_settings(auth: &AuthSettings) -> Self {
        let agents = auth
            .agents
            .iter()
            .map(|(user, agent)| {
                (
                    UserId::from(user.as_str()),
                    AgentCredential {
                        secret: agent.secret.clone(),
                        platform: agent.platform.clone(),
                    },
                )
            })
            .collect();
        Self { agents }
    }

    /// Add or replace one agent.
    #[must_use]
    pub fn with_agent(
        mut self,
        user_id: impl Into<UserId>,
        secret: impl Into<String>,
        platform: impl Into<String>,
    ) -> Self {
        let _ = self.agents.insert(
            user_id.into(),
            AgentCredential {
                secret: secret.into(),
                platform: platform.into(),
            },
        );
        self
    }

    /// Number of known agents.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether no agent is known.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn credential(&self, user_id: &UserId) -> Option<AgentCredential> {
        self.agents.get(user_id).cloned()
    }
}
