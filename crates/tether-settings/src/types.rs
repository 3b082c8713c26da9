//! Settings types.
//!
//! Every struct is `#[serde(default)]` so a partial JSON file only needs the
//! keys it overrides.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Upper bound for any request deadline or liveness window (one hour).
pub const MAX_TIMEOUT_MS: u64 = 3_600_000;
/// Lower bound for the liveness window and ping interval.
pub const MIN_LIVENESS_MS: u64 = 100;
/// Lower bound for the registry entry TTL.
pub const MIN_REGISTRY_TTL_MS: u64 = 1_000;
/// Upper bound for the ping interval.
pub const MAX_PING_INTERVAL_MS: u64 = 600_000;

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// HTTP / WebSocket listener.
    pub server: ServerSettings,
    /// Dispatch timeouts and agent liveness.
    pub relay: RelaySettings,
    /// Caller token and agent credentials.
    pub auth: AuthSettings,
    /// Multi-instance shared state.
    pub cluster: ClusterSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl TetherSettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.relay.default_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "relay.defaultTimeoutMs must be positive".into(),
            ));
        }
        if self.relay.max_timeout_ms > MAX_TIMEOUT_MS {
            return Err(SettingsError::InvalidValue(format!(
                "relay.maxTimeoutMs ({}) exceeds {MAX_TIMEOUT_MS}",
                self.relay.max_timeout_ms
            )));
        }
        if self.relay.max_timeout_ms < self.relay.default_timeout_ms {
            return Err(SettingsError::InvalidValue(format!(
                "relay.maxTimeoutMs ({}) is below relay.defaultTimeoutMs ({})",
                self.relay.max_timeout_ms, self.relay.default_timeout_ms
            )));
        }
        if !(MIN_LIVENESS_MS..=MAX_TIMEOUT_MS).contains(&self.relay.liveness_timeout_ms) {
            return Err(SettingsError::InvalidValue(format!(
                "relay.livenessTimeoutMs must be within {MIN_LIVENESS_MS}..={MAX_TIMEOUT_MS}"
            )));
        }
        if !(MIN_LIVENESS_MS..=MAX_PING_INTERVAL_MS).contains(&self.relay.ping_interval_ms) {
            return Err(SettingsError::InvalidValue(format!(
                "relay.pingIntervalMs must be within {MIN_LIVENESS_MS}..={MAX_PING_INTERVAL_MS}"
            )));
        }
        if self.relay.sweep_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "relay.sweepIntervalMs must be positive".into(),
            ));
        }
        if self.relay.send_queue == 0 {
            return Err(SettingsError::InvalidValue(
                "relay.sendQueue must be positive".into(),
            ));
        }
        if !(MIN_REGISTRY_TTL_MS..=MAX_TIMEOUT_MS).contains(&self.cluster.registry_ttl_ms) {
            return Err(SettingsError::InvalidValue(format!(
                "cluster.registryTtlMs must be within {MIN_REGISTRY_TTL_MS}..={MAX_TIMEOUT_MS}"
            )));
        }
        if self.cluster.backend == ClusterBackend::Redis && self.cluster.redis_url.is_empty() {
            return Err(SettingsError::InvalidValue(
                "cluster.redisUrl is required for the redis backend".into(),
            ));
        }
        Ok(())
    }
}

/// Listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` to auto-assign).
    pub port: u16,
    /// Maximum concurrent agent sockets on this instance.
    pub max_connections: usize,
    /// Maximum WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8787,
            max_connections: 1000,
            max_message_size: 16 * 1024 * 1024, // 16 MB
        }
    }
}

/// Dispatch and liveness tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Deadline applied when the caller gives none.
    pub default_timeout_ms: u64,
    /// Upper bound for caller-supplied deadlines.
    pub max_timeout_ms: u64,
    /// How often the correlator sweeps for overdue requests.
    pub sweep_interval_ms: u64,
    /// Interval between server-initiated WebSocket pings.
    pub ping_interval_ms: u64,
    /// Close an agent socket after this long without pong or heartbeat.
    pub liveness_timeout_ms: u64,
    /// Outbound frame queue per agent socket.
    pub send_queue: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_timeout_ms: 300_000,
            sweep_interval_ms: 1_000,
            ping_interval_ms: 30_000,
            liveness_timeout_ms: 90_000,
            send_queue: 256,
        }
    }
}

/// Authentication settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// Bearer token required on the caller API. Open when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    /// Agent credentials keyed by user id.
    pub agents: BTreeMap<String, AgentCredentialSettings>,
}

/// One agent's connection credential.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCredentialSettings {
    /// Shared secret the agent presents when connecting.
    pub secret: String,
    /// Platform label (e.g. `"macos"`), informational.
    #[serde(default = "default_platform")]
    pub platform: String,
}

fn default_platform() -> String {
    "unknown".to_string()
}

/// Where the agent registry and forwarding channel live.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterBackend {
    /// Process-local only (single instance).
    #[default]
    Memory,
    /// Redis keys + pub/sub shared by every instance.
    Redis,
}

/// Multi-instance settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSettings {
    /// Fixed identity for this instance. Generated at startup when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Shared-state backend.
    pub backend: ClusterBackend,
    /// Redis connection URL for the redis backend.
    pub redis_url: String,
    /// How long a registry entry outlives its last refresh. Entries of a
    /// crashed instance disappear after this.
    pub registry_ttl_ms: u64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            instance_id: None,
            backend: ClusterBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            registry_ttl_ms: 60_000,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level when `RUST_LOG` is unset.
    pub level: String,
    /// One JSON object per line.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = TetherSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.server.port, 8787);
        assert_eq!(settings.relay.default_timeout_ms, 30_000);
        assert_eq!(settings.relay.max_timeout_ms, 300_000);
        assert_eq!(settings.cluster.backend, ClusterBackend::Memory);
        assert!(settings.auth.api_token.is_none());
    }

    #[test]
    fn max_below_default_is_invalid() {
        let mut settings = TetherSettings::default();
        settings.relay.max_timeout_ms = 10;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn file_values_get_the_same_bounds_as_env_overrides() {
        let mut settings = TetherSettings::default();
        settings.relay.max_timeout_ms = u64::MAX;
        assert!(settings.validate().is_err());

        let mut settings = TetherSettings::default();
        settings.relay.liveness_timeout_ms = 0;
        assert!(settings.validate().is_err());

        let mut settings = TetherSettings::default();
        settings.relay.ping_interval_ms = 10;
        assert!(settings.validate().is_err());

        let mut settings = TetherSettings::default();
        settings.cluster.registry_ttl_ms = 10;
        assert!(settings.validate().is_err());

        let mut settings = TetherSettings::default();
        settings.relay.max_timeout_ms = MAX_TIMEOUT_MS;
        settings.relay.liveness_timeout_ms = MIN_LIVENESS_MS;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn zero_send_queue_is_invalid() {
        let mut settings = TetherSettings::default();
        settings.relay.send_queue = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn camel_case_keys() {
        let value = serde_json::to_value(TetherSettings::default()).unwrap();
        assert!(value["relay"]["defaultTimeoutMs"].is_number());
        assert!(value["server"]["maxConnections"].is_number());
        assert_eq!(value["cluster"]["backend"], "memory");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: TetherSettings =
            serde_json::from_str(r#"{"relay":{"defaultTimeoutMs":5000}}"#).unwrap();
        assert_eq!(settings.relay.default_timeout_ms, 5000);
        assert_eq!(settings.relay.max_timeout_ms, 300_000);
        assert_eq!(settings.server.host, "0.0.0.0");
    }

    #[test]
    fn agent_credential_platform_defaults() {
        let settings: TetherSettings =
            serde_json::from_str(r#"{"auth":{"agents":{"u1":{"secret":"s3cret"}}}}"#).unwrap();
        let cred = &settings.auth.agents["u1"];
        assert_eq!(cred.secret, "s3cret");
        assert_eq!(cred.platform, "unknown");
    }
}
