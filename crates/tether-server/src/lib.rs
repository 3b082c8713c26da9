//! # tether-server
//!
//! Axum HTTP + `WebSocket` surface for the relay.
//!
//! - Agent gateway: `GET /agent` upgrade with credential check, per-socket
//!   session loop, Ping frames and a liveness watchdog
//! - Caller API: `POST /api/tool-call`, `POST /api/browser`,
//!   `GET /api/agent-status`, optionally behind a bearer token
//! - Operations: `GET /health` and Prometheus `GET /metrics`
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod api;
pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use errors::{ApiError, ServerError};
pub use server::{AppState, TetherServer};
pub use shutdown::ShutdownCoordinator;
