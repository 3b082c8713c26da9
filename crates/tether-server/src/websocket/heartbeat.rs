//! Liveness watchdog for agent sockets.

use std::sync::Arc;
use std::time::Duration;

use tether_relay::AgentSession;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Outcome of the watchdog loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// No heartbeat, ping or pong within the timeout window.
    TimedOut,
    /// The watchdog was cancelled externally.
    Cancelled,
}

/// Watch `session` until it goes quiet for `timeout` or `cancel` fires.
///
/// Any sign of life ([`AgentSession::touch`]) resets the window; the check
/// runs every `check_interval`.
pub async fn run_heartbeat(
    session: Arc<AgentSession>,
    check_interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut ticker = time::interval(check_interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if session.idle_for() >= timeout {
                    return HeartbeatResult::TimedOut;
                }
            }
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
        }
    }
}
