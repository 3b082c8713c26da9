//! `TetherServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tether_relay::{CredentialStore, Relay};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::api;
use crate::config::ServerConfig;
use crate::errors::{Result, ServerError};
use crate::health::{self, HealthResponse};
use crate::metrics;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::handler::agent_upgrade;

/// How long agent sockets get to detach before shutdown detaches them itself.
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The relay node.
    pub relay: Arc<Relay>,
    /// Agent credential lookup.
    pub credentials: Arc<dyn CredentialStore>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The Tether server.
pub struct TetherServer {
    config: Arc<ServerConfig>,
    relay: Arc<Relay>,
    credentials: Arc<dyn CredentialStore>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl TetherServer {
    /// Create a server around a relay node.
    pub fn new(
        config: ServerConfig,
        relay: Arc<Relay>,
        credentials: Arc<dyn CredentialStore>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            relay,
            credentials,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics,
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            relay: Arc::clone(&self.relay),
            credentials: Arc::clone(&self.credentials),
            config: Arc::clone(&self.config),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        let api = Router::new()
            .route("/api/tool-call", post(api::tool_call))
            .route("/api/browser", post(api::browser))
            .route("/api/agent-status", get(api::agent_status))
            .route_layer(middleware::from_fn_with_state(
                state.clone(),
                api::require_api_token,
            ));

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/agent", get(agent_upgrade))
            .merge(api)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind and serve until the shutdown coordinator fires.
    ///
    /// Returns the bound address (useful with port `0`) and the server task.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let router = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(error) = served {
                error!(%error, "http server failed");
            }
        });

        info!(
            %local_addr,
            server_id = %self.relay.instance_id(),
            "tether server listening"
        );
        Ok((local_addr, handle))
    }

    /// Stop serving and tear everything down.
    ///
    /// 1. Fires the shutdown token: no new upgrades, every socket loop exits
    /// 2. Drains the relay, so each session is detached and unregistered
    /// 3. Waits for `tasks` (bus consumer, sweeper, HTTP server)
    pub async fn stop(&self, tasks: Vec<JoinHandle<()>>) {
        self.shutdown.shutdown();
        self.relay.drain(SESSION_DRAIN_TIMEOUT).await;
        self.shutdown.graceful_shutdown(tasks, None).await;
    }

    /// Get the relay node.
    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(state.start_time, &state.relay))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tether_core::ServerInstanceId;
    use tether_relay::{MemoryBus, MemoryRegistry, RelayConfig, StaticCredentialStore};
    use tower::ServiceExt;

    fn make_server(metrics: Option<PrometheusHandle>) -> TetherServer {
        let relay = Arc::new(Relay::new(
            ServerInstanceId::from("node-a"),
            Arc::new(MemoryRegistry::new()),
            Arc::new(MemoryBus::new()),
            RelayConfig::default(),
        ));
        TetherServer::new(
            ServerConfig::default(),
            relay,
            Arc::new(StaticCredentialStore::new().with_agent("u1", "s3cret", "linux")),
            metrics,
        )
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn accessors() {
        let server = make_server(None);
        assert_eq!(server.config().port, 0);
        assert!(!server.shutdown().is_shutting_down());
        assert_eq!(server.relay().instance_id().as_str(), "node-a");
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let app = make_server(None).router();
        let resp = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["serverId"], "node-a");
        assert_eq!(parsed["connectionCount"], 0);
    }

    #[tokio::test]
    async fn metrics_endpoint_needs_recorder() {
        let app = make_server(None).router();
        let resp = app.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let handle = PrometheusBuilder::new().build_recorder().handle();
        let app = make_server(Some(handle)).router();
        let resp = app.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn agent_endpoint_rejects_bad_credentials_before_upgrade() {
        let app = make_server(None).router();
        for uri in [
            "/agent",
            "/agent?userId=u1",
            "/agent?userId=u1&secret=wrong",
            "/agent?userId=u9&secret=s3cret",
        ] {
            let resp = app.clone().oneshot(get(uri)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "uri: {uri}");
        }
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let app = make_server(None).router();
        let resp = app.oneshot(get("/nonexistent")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_binds_ephemeral_port() {
        let server = make_server(None);
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        server.shutdown().shutdown();
        handle.await.unwrap();
    }
}
