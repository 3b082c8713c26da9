//! Metric names recorded by the relay core.
//!
//! The recorder itself is installed by the binary; until then every
//! `metrics` macro is a no-op.

/// Dispatched calls (counter, labels: route = `local` | `forwarded`).
pub const RELAY_CALLS_TOTAL: &str = "relay_calls_total";
/// Settled calls (counter, labels: outcome = `ok` | error kind).
pub const RELAY_CALL_OUTCOMES_TOTAL: &str = "relay_call_outcomes_total";
/// Call latency from dispatch to settlement (histogram).
pub const RELAY_CALL_DURATION_SECONDS: &str = "relay_call_duration_seconds";
/// Requests currently awaiting a reply on this process (gauge).
pub const RELAY_PENDING_REQUESTS: &str = "relay_pending_requests";
/// Requests expired by deadline (counter).
pub const RELAY_REQUESTS_EXPIRED_TOTAL: &str = "relay_requests_expired_total";
/// Late settlements discarded because the request had already settled (counter).
pub const RELAY_DUPLICATES_SUPPRESSED_TOTAL: &str = "relay_duplicates_suppressed_total";
/// Agent sessions established (counter).
pub const AGENT_SESSIONS_TOTAL: &str = "agent_sessions_total";
/// Agent sessions replaced by a reconnect, locally or on another process (counter).
pub const AGENT_SESSIONS_REPLACED_TOTAL: &str = "agent_sessions_replaced_total";
/// Live agent sessions on this process (gauge).
pub const AGENT_SESSIONS_ACTIVE: &str = "agent_sessions_active";
/// Agent frames that failed to decode (counter).
pub const AGENT_MALFORMED_FRAMES_TOTAL: &str = "agent_malformed_frames_total";
/// Outbound frames dropped because the agent's queue was full or closed (counter).
pub const AGENT_FRAMES_DROPPED_TOTAL: &str = "agent_frames_dropped_total";
/// Cross-process messages (counter, labels: kind, direction = `in` | `out`).
pub const BUS_MESSAGES_TOTAL: &str = "bus_messages_total";
/// Bus subscriptions re-established after the backend dropped them (counter).
pub const BUS_RESUBSCRIBES_TOTAL: &str = "bus_resubscribes_total";
