//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;
use tether_relay::Relay;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// This instance's id.
    pub server_id: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Agent sockets held by this instance.
    pub connection_count: usize,
    /// Users whose agent socket is held here, sorted.
    pub connected_user_ids: Vec<String>,
    /// Callers waiting on this instance.
    pub pending_requests: usize,
}

/// Build a health response from live relay state.
pub fn health_check(start_time: Instant, relay: &Relay) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        server_id: relay.instance_id().to_string(),
        uptime_secs: start_time.elapsed().as_secs(),
        connection_count: relay.connection_count(),
        connected_user_ids: relay
            .connected_users()
            .into_iter()
            .map(tether_core::UserId::into_inner)
            .collect(),
        pending_requests: relay.pending_count(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tether_core::{ServerInstanceId, UserId};
    use tether_relay::{MemoryBus, MemoryRegistry, RelayConfig};

    use super::*;

    fn relay() -> Relay {
        Relay::new(
            ServerInstanceId::from("node-h"),
            Arc::new(MemoryRegistry::new()),
            Arc::new(MemoryBus::new()),
            RelayConfig::default(),
        )
    }

    #[test]
    fn idle_relay() {
        let resp = health_check(Instant::now(), &relay());
        assert_eq!(resp.status, "ok");
        assert_eq!(resp.server_id, "node-h");
        assert_eq!(resp.connection_count, 0);
        assert!(resp.connected_user_ids.is_empty());
        assert_eq!(resp.pending_requests, 0);
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now().checked_sub(Duration::from_secs(60)).unwrap();
        assert!(health_check(start, &relay()).uptime_secs >= 59);
    }

    #[tokio::test]
    async fn lists_connected_users() {
        let relay = relay();
        let (_b, _rx_b) = relay.attach(UserId::from("bob"), "linux").await.unwrap();
        let (_a, _rx_a) = relay.attach(UserId::from("alice"), "macos").await.unwrap();

        let resp = health_check(Instant::now(), &relay);
        assert_eq!(resp.connection_count, 2);
        assert_eq!(resp.connected_user_ids, vec!["alice", "bob"]);
    }

    #[test]
    fn serializes_camel_case() {
        let value = serde_json::to_value(health_check(Instant::now(), &relay())).unwrap();
        assert_eq!(value["serverId"], "node-h");
        assert!(value["uptimeSecs"].is_number());
        assert!(value["connectionCount"].is_number());
        assert!(value["connectedUserIds"].is_array());
        assert!(value["pendingRequests"].is_number());
    }
}
