//! `GET /agent` upgrade: authenticate before the socket exists.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use metrics::counter;
use serde::Deserialize;
use tether_core::{RelayError, UserId};
use tracing::{debug, warn};

use super::session::run_agent_session;
use crate::errors::ApiError;
use crate::metrics::WS_REJECTED_TOTAL;
use crate::server::AppState;

/// Connection parameters an agent presents.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConnectParams {
    /// User the agent acts for.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Shared secret.
    #[serde(default)]
    pub secret: Option<String>,
}

fn reject(reason: &'static str, error: ApiError) -> Response {
    counter!(WS_REJECTED_TOTAL, "reason" => reason).increment(1);
    error.into_response()
}

fn rejection_error(rejection: &WebSocketUpgradeRejection) -> ApiError {
    ApiError::from(RelayError::malformed(rejection.body_text())).with_status(rejection.status())
}

/// GET /agent?userId=…&secret=…
///
/// Credentials and capacity are checked before the upgrade request itself,
/// so a bad agent is refused with a plain HTTP status.
pub async fn agent_upgrade(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<AppState>,
    Query(params): Query<AgentConnectParams>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return reject(
            "shutting_down",
            ApiError::from(RelayError::transport("server is shutting down"))
                .with_status(StatusCode::SERVICE_UNAVAILABLE),
        );
    }

    let (Some(user_id), Some(secret)) = (
        params.user_id.filter(|id| !id.trim().is_empty()),
        params.secret,
    ) else {
        return reject(
            "missing_credentials",
            RelayError::unauthorized("userId and secret are required").into(),
        );
    };
    let user_id = UserId::from(user_id);

    let Some(platform) = state.credentials.verify(&user_id, &secret).await else {
        warn!(%user_id, "agent presented invalid credentials");
        return reject(
            "unauthorized",
            RelayError::unauthorized("invalid agent credentials").into(),
        );
    };

    // A reconnect replaces the existing socket, so it never counts against the cap.
    if state.relay.session(&user_id).is_none()
        && state.relay.connection_count() >= state.config.max_connections
    {
        warn!(%user_id, max = state.config.max_connections, "agent connection limit reached");
        return reject(
            "capacity",
            ApiError::from(RelayError::transport("agent connection limit reached"))
                .with_status(StatusCode::SERVICE_UNAVAILABLE),
        );
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return reject("not_websocket", rejection_error(&rejection)),
    };

    debug!(%user_id, %platform, "upgrading agent socket");
    let relay = Arc::clone(&state.relay);
    let config = Arc::clone(&state.config);
    let shutdown = state.shutdown.token();
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| {
            run_agent_session(socket, relay, config, user_id, platform, shutdown)
        })
        .into_response()
}
