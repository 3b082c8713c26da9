//! Server configuration.

use std::time::Duration;

use tether_settings::TetherSettings;

/// Configuration for the Tether server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent agent sockets on this instance.
    pub max_connections: usize,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Interval between server-initiated Ping frames.
    pub ping_interval: Duration,
    /// Close an agent socket after this long without a sign of life.
    pub liveness_timeout: Duration,
    /// Bearer token required on `/api/*` when set.
    pub api_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 1000,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            ping_interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(90),
            api_token: None,
        }
    }
}

impl ServerConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &TetherSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_connections: settings.server.max_connections,
            max_message_size: settings.server.max_message_size,
            ping_interval: Duration::from_millis(settings.relay.ping_interval_ms),
            liveness_timeout: Duration::from_millis(settings.relay.liveness_timeout_ms),
            api_token: settings
                .auth
                .api_token
                .clone()
                .filter(|token| !token.is_empty()),
        }
    }

    /// How often the liveness watchdog looks at a socket.
    pub fn liveness_check_interval(&self) -> Duration {
        self.ping_interval
            .min(self.liveness_timeout / 2)
            .max(Duration::from_millis(10))
    }
}
