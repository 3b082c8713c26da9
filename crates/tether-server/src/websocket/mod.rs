//! Agent-facing WebSocket gateway: upgrade, session loop, liveness watchdog.

pub mod handler;
pub mod heartbeat;
pub mod session;
