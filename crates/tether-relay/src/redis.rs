//! Redis-backed registry and bus for multi-process deployments.
//!
//! Every instance points at the same Redis. Ownership lives under
//! `tether:agent:<userId>` with a TTL the owner keeps extending while the
//! socket lives, so a crashed instance's entries lapse on their own. Each
//! instance listens on `tether:instance:<serverInstanceId>`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tether_core::{RelayError, ServerInstanceId, UserId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bus::{BUS_CAPACITY, BusMessage, RelayBus};
use crate::registry::AgentRegistry;

const AGENT_KEY_PREFIX: &str = "tether:agent:";
const INSTANCE_CHANNEL_PREFIX: &str = "tether:instance:";

/// Lifetime of an ownership entry that is not refreshed.
pub const DEFAULT_ENTRY_TTL: Duration = Duration::from_secs(60);

/// Delete the key only while it still names the caller.
const COMPARE_AND_DELETE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// Extend the key's TTL only while it still names the caller.
const COMPARE_AND_EXPIRE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
";

fn agent_key(user_id: &UserId) -> String {
    format!("{AGENT_KEY_PREFIX}{user_id}")
}

fn instance_channel(instance: &ServerInstanceId) -> String {
    format!("{INSTANCE_CHANNEL_PREFIX}{instance}")
}

fn redis_error(error: &redis::RedisError) -> RelayError {
    RelayError::transport(format!("redis: {error}"))
}

/// Open a client for `url`.
pub fn open_client(url: &str) -> Result<Arc<redis::Client>, RelayError> {
    redis::Client::open(url)
        .map(Arc::new)
        .map_err(|error| redis_error(&error))
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// `UserId → ServerInstanceId` in Redis strings.
#[derive(Clone)]
pub struct RedisRegistry {
    client: Arc<redis::Client>,
    entry_ttl: Duration,
    unregister: Arc<redis::Script>,
    refresh: Arc<redis::Script>,
}

impl RedisRegistry {
    /// Registry over a shared client, entries living [`DEFAULT_ENTRY_TTL`].
    pub fn new(client: Arc<redis::Client>) -> Self {
        Self {
            client,
            entry_ttl: DEFAULT_ENTRY_TTL,
            unregister: Arc::new(redis::Script::new(COMPARE_AND_DELETE)),
            refresh: Arc::new(redis::Script::new(COMPARE_AND_EXPIRE)),
        }
    }

    /// Let unrefreshed entries expire after `ttl`.
    #[must_use]
    pub fn with_entry_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = ttl.max(Duration::from_millis(1));
        self
    }

    fn ttl_millis(&self) -> u64 {
        u64::try_from(self.entry_ttl.as_millis()).unwrap_or(u64::MAX)
    }

    async fn connection(&self) -> Result<redis::aio::Connection, RelayError> {
        self.client
            .get_async_connection()
            .await
            .map_err(|error| redis_error(&error))
    }
}

#[async_trait]
impl AgentRegistry for RedisRegistry {
    async fn register(
        &self,
        user_id: &UserId,
        owner: &ServerInstanceId,
    ) -> Result<Option<ServerInstanceId>, RelayError> {
        let mut conn = self.connection().await?;
        let previous: Option<String> = redis::cmd("SET")
            .arg(agent_key(user_id))
            .arg(owner.as_str())
            .arg("PX")
            .arg(self.ttl_millis())
            .arg("GET")
            .query_async(&mut conn)
            .await
            .map_err(|error| redis_error(&error))?;
        Ok(previous.map(ServerInstanceId::from))
    }

    async fn lookup(&self, user_id: &UserId) -> Result<Option<ServerInstanceId>, RelayError> {
        let mut conn = self.connection().await?;
        let owner: Option<String> = redis::cmd("GET")
            .arg(agent_key(user_id))
            .query_async(&mut conn)
            .await
            .map_err(|error| redis_error(&error))?;
        Ok(owner.map(ServerInstanceId::from))
    }

    async fn unregister(
        &self,
        user_id: &UserId,
        owner: &ServerInstanceId,
    ) -> Result<bool, RelayError> {
        let mut conn = self.connection().await?;
        let deleted: i64 = self
            .unregister
            .key(agent_key(user_id))
            .arg(owner.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(|error| redis_error(&error))?;
        Ok(deleted > 0)
    }

    async fn refresh(
        &self,
        user_id: &UserId,
        owner: &ServerInstanceId,
    ) -> Result<bool, RelayError> {
        let mut conn = self.connection().await?;
        let extended: i64 = self
            .refresh
            .key(agent_key(user_id))
            .arg(owner.as_str())
            .arg(self.ttl_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(|error| redis_error(&error))?;
        Ok(extended > 0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bus
// ─────────────────────────────────────────────────────────────────────────────

/// Instance-addressed pub/sub over Redis channels, JSON payloads.
#[derive(Clone)]
pub struct RedisBus {
    client: Arc<redis::Client>,
}

impl RedisBus {
    /// Bus over a shared client.
    pub fn new(client: Arc<redis::Client>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RelayBus for RedisBus {
    async fn publish(
        &self,
        target: &ServerInstanceId,
        message: BusMessage,
    ) -> Result<(), RelayError> {
        let payload = serde_json::to_string(&message)
            .map_err(|error| RelayError::internal(format!("encode bus message: {error}")))?;
        let mut conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|error| redis_error(&error))?;
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(instance_channel(target))
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|error| redis_error(&error))?;
        if receivers == 0 {
            return Err(RelayError::transport(format!(
                "instance {target} is not reachable"
            )));
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        instance: &ServerInstanceId,
    ) -> Result<mpsc::Receiver<BusMessage>, RelayError> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|error| redis_error(&error))?;
        let channel = instance_channel(instance);
        let mut pubsub = conn.into_pubsub();
        pubsub
            .subscribe(&channel)
            .await
            .map_err(|error| redis_error(&error))?;

        let (tx, rx) = mpsc::channel(BUS_CAPACITY);
        drop(tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(error) => {
                        warn!(%channel, %error, "unreadable bus payload");
                        continue;
                    }
                };
                let message = match serde_json::from_str::<BusMessage>(&payload) {
                    Ok(message) => message,
                    Err(error) => {
                        warn!(%channel, %error, "malformed bus message");
                        continue;
                    }
                };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            // Dropping `tx` tells the consumer to subscribe again.
            debug!(%channel, "redis subscription ended");
        }));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(agent_key(&UserId::from("u1")), "tether:agent:u1");
        assert_eq!(
            instance_channel(&ServerInstanceId::from("node-a")),
            "tether:instance:node-a"
        );
    }

    #[test]
    fn bad_url_is_transport_error() {
        assert!(matches!(
            open_client("not a url"),
            Err(RelayError::Transport { .. })
        ));
    }

    #[test]
    fn entry_ttl_is_configurable() {
        let client = open_client("redis://127.0.0.1:6379").unwrap();
        let registry = RedisRegistry::new(client);
        assert_eq!(registry.ttl_millis(), 60_000);
        assert_eq!(
            registry.with_entry_ttl(Duration::from_millis(1_500)).ttl_millis(),
            1_500
        );
    }

    /// Live Redis from `TETHER_REDIS_URL`; these tests pass trivially without one.
    fn live_registry(ttl: Duration) -> Option<RedisRegistry> {
        let url = std::env::var("TETHER_REDIS_URL").ok()?;
        Some(RedisRegistry::new(open_client(&url).unwrap()).with_entry_ttl(ttl))
    }

    fn unique_user() -> UserId {
        UserId::from(format!("test-{}", tether_core::RequestId::new()))
    }

    #[tokio::test]
    async fn compare_and_delete_against_live_redis() {
        let Some(registry) = live_registry(DEFAULT_ENTRY_TTL) else {
            return;
        };
        let user = unique_user();
        let a = ServerInstanceId::from("node-a");
        let b = ServerInstanceId::from("node-b");

        assert!(!registry.is_connected(&user).await.unwrap());
        assert_eq!(registry.register(&user, &a).await.unwrap(), None);
        assert_eq!(registry.register(&user, &b).await.unwrap(), Some(a.clone()));

        assert!(!registry.unregister(&user, &a).await.unwrap());
        assert_eq!(registry.lookup(&user).await.unwrap(), Some(b.clone()));

        assert!(registry.unregister(&user, &b).await.unwrap());
        assert!(!registry.is_connected(&user).await.unwrap());
    }

    #[tokio::test]
    async fn unrefreshed_entries_expire_against_live_redis() {
        let Some(registry) = live_registry(Duration::from_millis(300)) else {
            return;
        };
        let user = unique_user();
        let a = ServerInstanceId::from("node-a");
        let _ = registry.register(&user, &a).await.unwrap();

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            assert!(registry.refresh(&user, &a).await.unwrap());
        }
        assert!(!registry
            .refresh(&user, &ServerInstanceId::from("node-b"))
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!registry.is_connected(&user).await.unwrap());
        assert!(!registry.refresh(&user, &a).await.unwrap());
    }
}
