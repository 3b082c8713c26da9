//! # tetherd
//!
//! Tether relay binary: loads settings, picks the cluster backend, wires the
//! relay into the HTTP/WebSocket server and runs until SIGINT/SIGTERM.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tether_core::ServerInstanceId;
use tether_relay::{
    AgentRegistry, MemoryBus, MemoryRegistry, Relay, RelayBus, RelayConfig, StaticCredentialStore,
};
use tether_server::{ServerConfig, TetherServer};
use tether_settings::{ClusterBackend, ClusterSettings, TetherSettings};
use tracing::{info, warn};

/// Tether relay server.
#[derive(Parser, Debug)]
#[command(
    name = "tetherd",
    version,
    about = "Relay commands to users' agents over pinned WebSockets"
)]
struct Cli {
    /// Settings file (defaults to `~/.tether/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Fixed instance id (overrides settings; generated when unset).
    #[arg(long)]
    instance_id: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn apply(&self, settings: &mut TetherSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(id) = &self.instance_id {
            settings.cluster.instance_id = Some(id.clone());
        }
        if self.log_json {
            settings.logging.json = true;
        }
    }
}

type Backend = (Arc<dyn AgentRegistry>, Arc<dyn RelayBus>);

fn build_backend(cluster: &ClusterSettings) -> Result<Backend> {
    match cluster.backend {
        ClusterBackend::Memory => Ok((Arc::new(MemoryRegistry::new()), Arc::new(MemoryBus::new()))),
        ClusterBackend::Redis => redis_backend(cluster),
    }
}

#[cfg(feature = "redis")]
fn redis_backend(cluster: &ClusterSettings) -> Result<Backend> {
    use tether_relay::redis::{RedisBus, RedisRegistry, open_client};

    let client = open_client(&cluster.redis_url).context("Invalid redis URL")?;
    let registry = RedisRegistry::new(Arc::clone(&client))
        .with_entry_ttl(Duration::from_millis(cluster.registry_ttl_ms));
    Ok((
        Arc::new(registry),
        Arc::new(RedisBus::new(client)),
    ))
}

#[cfg(not(feature = "redis"))]
fn redis_backend(_cluster: &ClusterSettings) -> Result<Backend> {
    anyhow::bail!("cluster backend \"redis\" requires building with the `redis` feature")
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for ctrl-c")?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let mut settings = match &args.settings {
        Some(path) => tether_settings::load_settings_from_path(path),
        None => tether_settings::load_settings(),
    }
    .context("Failed to load settings")?;
    args.apply(&mut settings);

    tether_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);
    let metrics = tether_server::metrics::install_recorder()?;

    let instance_id = settings
        .cluster
        .instance_id
        .clone()
        .map_or_else(ServerInstanceId::new, ServerInstanceId::from);
    let (registry, bus) = build_backend(&settings.cluster)?;
    let relay = Arc::new(Relay::new(
        instance_id,
        registry,
        bus,
        RelayConfig::from_settings(&settings.relay)
            .with_registry_ttl(Duration::from_millis(settings.cluster.registry_ttl_ms)),
    ));

    let credentials = StaticCredentialStore::from_settings(&settings.auth);
    if credentials.is_empty() {
        warn!("no agent credentials configured, every agent connection will be refused");
    }
    if settings.auth.api_token.is_none() {
        warn!("auth.apiToken is unset, the caller API is open to anyone who can reach it");
    }

    let server = TetherServer::new(
        ServerConfig::from_settings(&settings),
        relay,
        Arc::new(credentials),
        Some(metrics),
    );

    let mut tasks = server
        .relay()
        .start(server.shutdown().token())
        .await
        .context("Failed to start relay")?;
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tasks.push(handle);

    info!(
        server_id = %server.relay().instance_id(),
        backend = ?settings.cluster.backend,
        "Tether relay listening on http://{addr}"
    );

    shutdown_signal().await?;

    info!("Shutting down...");
    server.stop(tasks).await;
    info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_settings() {
        let args = Cli::parse_from([
            "tetherd",
            "--host",
            "127.0.0.1",
            "--port",
            "0",
            "--instance-id",
            "node-7",
            "--log-json",
        ]);
        let mut settings = TetherSettings::default();
        args.apply(&mut settings);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 0);
        assert_eq!(settings.cluster.instance_id.as_deref(), Some("node-7"));
        assert!(settings.logging.json);
    }

    #[test]
    fn no_flags_keep_settings() {
        let args = Cli::parse_from(["tetherd"]);
        let mut settings = TetherSettings::default();
        args.apply(&mut settings);
        assert_eq!(settings.server.port, 8787);
        assert!(settings.cluster.instance_id.is_none());
    }

    #[test]
    fn memory_backend_builds() {
        assert!(build_backend(&ClusterSettings::default()).is_ok());
    }

    #[cfg(not(feature = "redis"))]
    #[test]
    fn redis_backend_needs_feature() {
        let cluster = ClusterSettings {
            backend: ClusterBackend::Redis,
            ..ClusterSettings::default()
        };
        assert!(build_backend(&cluster).is_err());
    }
}
