//! Caller-facing HTTP API.
//!
//! Every handler answers `{success:true, result}` or the error body of
//! [`ApiError`]. Malformed JSON is reported in the same shape rather than
//! axum's default rejection text.

use std::time::Instant;

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use metrics::{counter, histogram};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use tether_core::{BrowserCommand, CallResult, RelayError, UserId};
use tracing::debug;

use crate::errors::ApiError;
use crate::metrics::{HTTP_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS};
use crate::server::AppState;

/// `POST /api/tool-call` body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    /// Target user.
    pub user_id: String,
    /// Tool name.
    pub tool: String,
    /// Tool parameters; an empty object when omitted.
    #[serde(default = "empty_object")]
    pub params: Value,
    /// Caller deadline override.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// `POST /api/browser` body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserRequest {
    /// Target user.
    pub user_id: String,
    /// Browser command, tagged by `type`.
    pub command: BrowserCommand,
    /// Caller deadline override.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// `GET /api/agent-status` query.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusQuery {
    /// User to look up.
    #[serde(default)]
    pub user_id: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn user_id(raw: &str) -> Result<UserId, ApiError> {
    if raw.trim().is_empty() {
        return Err(RelayError::malformed("userId must be a non-empty string").into());
    }
    Ok(UserId::from(raw))
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| RelayError::malformed(rejection.body_text()).into())
}

fn respond(route: &'static str, started: Instant, result: CallResult) -> Response {
    let response = match result {
        Ok(result) => Json(json!({ "success": true, "result": result })).into_response(),
        Err(error) => ApiError::from(error).into_response(),
    };
    record(route, started, &response);
    response
}

fn record(route: &'static str, started: Instant, response: &Response) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "route" => route,
        "status" => response.status().as_u16().to_string()
    )
    .increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "route" => route)
        .record(started.elapsed().as_secs_f64());
}

/// POST /api/tool-call
pub async fn tool_call(
    State(state): State<AppState>,
    payload: Result<Json<ToolCallRequest>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    let result = async {
        let request = body(payload)?;
        let user_id = user_id(&request.user_id)?;
        Ok::<_, ApiError>(
            state
                .relay
                .call_tool(&user_id, &request.tool, request.params, request.timeout_ms)
                .await,
        )
    }
    .await;
    match result {
        Ok(result) => respond("tool_call", started, result),
        Err(error) => {
            let response = error.into_response();
            record("tool_call", started, &response);
            response
        }
    }
}

/// POST /api/browser
pub async fn browser(
    State(state): State<AppState>,
    payload: Result<Json<BrowserRequest>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    let result = async {
        let request = body(payload)?;
        let user_id = user_id(&request.user_id)?;
        Ok::<_, ApiError>(
            state
                .relay
                .browser(&user_id, request.command, request.timeout_ms)
                .await,
        )
    }
    .await;
    match result {
        Ok(result) => respond("browser", started, result),
        Err(error) => {
            let response = error.into_response();
            record("browser", started, &response);
            response
        }
    }
}

/// GET /api/agent-status
pub async fn agent_status(
    State(state): State<AppState>,
    query: Result<Query<AgentStatusQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(query) =
        query.map_err(|rejection| ApiError::from(RelayError::malformed(rejection.body_text())))?;
    let user_id = user_id(query.user_id.as_deref().unwrap_or_default())?;

    let body = match state.relay.owner_of(&user_id).await? {
        Some(owner) => json!({ "connected": true, "serverId": owner }),
        None => json!({ "connected": false }),
    };
    Ok(Json(body))
}

/// Reject `/api/*` requests without the configured bearer token.
pub async fn require_api_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.api_token.as_deref() else {
        return next.run(request).await;
    };

    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match presented {
        Some(token) if Sha256::digest(token.as_bytes()) == Sha256::digest(expected.as_bytes()) => {
            next.run(request).await
        }
        _ => {
            debug!(path = %request.uri().path(), "rejected caller without valid api token");
            ApiError::from(RelayError::unauthorized("missing or invalid bearer token"))
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use tether_core::ServerInstanceId;
    use tether_relay::{MemoryBus, MemoryRegistry, Relay, RelayConfig, StaticCredentialStore};
    use tower::ServiceExt;

    use crate::config::ServerConfig;
    use crate::server::TetherServer;

    fn server(api_token: Option<&str>) -> TetherServer {
        let relay = Arc::new(Relay::new(
            ServerInstanceId::from("node-a"),
            Arc::new(MemoryRegistry::new()),
            Arc::new(MemoryBus::new()),
            RelayConfig::default(),
        ));
        let config = ServerConfig {
            api_token: api_token.map(str::to_string),
            ..ServerConfig::default()
        };
        TetherServer::new(config, relay, Arc::new(StaticCredentialStore::new()), None)
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 100_000)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn tool_call_without_agent_is_503() {
        let app = server(None).router();
        let resp = app
            .oneshot(post(
                "/api/tool-call",
                r#"{"userId":"u2","tool":"echo","params":{},"timeoutMs":5000}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(resp).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "NOT_CONNECTED");
    }

    #[tokio::test]
    async fn malformed_bodies_are_400() {
        let app = server(None).router();
        for body in [
            "not json",
            r#"{"userId":"u1"}"#,
            r#"{"userId":"","tool":"echo"}"#,
            r#"{"userId":"u1","tool":"echo","params":[1]}"#,
            r#"{"userId":"u1","tool":"  "}"#,
        ] {
            let resp = app.clone().oneshot(post("/api/tool-call", body)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "body: {body}");
            assert_eq!(json_body(resp).await["code"], "MALFORMED_REQUEST");
        }
    }

    #[tokio::test]
    async fn unknown_browser_command_is_400() {
        let app = server(None).router();
        let resp = app
            .oneshot(post(
                "/api/browser",
                r#"{"userId":"u1","command":{"type":"teleport"}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn agent_status_reports_disconnected() {
        let app = server(None).router();
        let req = Request::builder()
            .uri("/api/agent-status?userId=u1")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["connected"], false);
        assert!(body.get("serverId").is_none());
    }

    #[tokio::test]
    async fn agent_status_requires_user_id() {
        let app = server(None).router();
        let req = Request::builder()
            .uri("/api/agent-status")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn api_token_is_enforced() {
        let app = server(Some("s3cret")).router();
        let body = r#"{"userId":"u1","tool":"echo"}"#;

        let resp = app.clone().oneshot(post("/api/tool-call", body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(resp).await["code"], "UNAUTHORIZED");

        let mut wrong = post("/api/tool-call", body);
        let _ = wrong
            .headers_mut()
            .insert("authorization", "Bearer nope".parse().unwrap());
        let resp = app.clone().oneshot(wrong).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let mut right = post("/api/tool-call", body);
        let _ = right
            .headers_mut()
            .insert("authorization", "Bearer s3cret".parse().unwrap());
        let resp = app.clone().oneshot(right).await.unwrap();
        // Authenticated: now it is the relay that answers.
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn health_is_not_behind_api_token() {
        let app = server(Some("s3cret")).router();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
