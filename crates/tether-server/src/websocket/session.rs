//! Agent socket lifecycle, from upgrade through disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::{SinkExt, StreamExt};
use metrics::{counter, histogram};
use tether_core::UserId;
use tether_relay::Relay;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, field, info, instrument, warn};

use super::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::config::ServerConfig;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
    WS_LIVENESS_TIMEOUTS_TOTAL,
};

/// How long teardown waits for the outbound forwarder to flush a close frame.
const OUTBOUND_DRAIN: Duration = Duration::from_secs(1);

/// Run one authenticated agent socket.
///
/// 1. Attaches a relay session (which queues `connected` first)
/// 2. Forwards queued frames to the socket, with periodic Ping frames
/// 3. Feeds inbound text to the relay; pings and pongs count as liveness
/// 4. Closes on peer close, replacement, liveness timeout or shutdown
/// 5. Always detaches, failing whatever was still in flight
#[instrument(skip_all, fields(user_id = %user_id, connection_id = field::Empty))]
pub async fn run_agent_session(
    ws: WebSocket,
    relay: Arc<Relay>,
    config: Arc<ServerConfig>,
    user_id: UserId,
    platform: String,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (session, mut outbound_rx) = match relay.attach(user_id, platform).await {
        Ok(attached) => attached,
        Err(error) => {
            warn!(%error, "could not attach agent session");
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::ERROR,
                    reason: "relay unavailable".into(),
                })))
                .await;
            return;
        }
    };
    let _ = Span::current().record("connection_id", field::display(session.connection_id()));

    let connection_start = Instant::now();
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    info!(platform = session.platform(), "agent connected");

    let closed = session.close_token();

    // Outbound forwarder with periodic Ping frames.
    let ping_interval = config.ping_interval;
    let outbound_closed = closed.clone();
    let mut outbound = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        let _ = ping.tick().await;

        loop {
            tokio::select! {
                frame = outbound_rx.recv() => {
                    let Some(text) = frame else { break };
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
                () = outbound_closed.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Liveness watchdog.
    let watchdog = {
        let session = Arc::clone(&session);
        let check_interval = config.liveness_check_interval();
        let timeout = config.liveness_timeout;
        let cancel = closed.clone();
        tokio::spawn(async move {
            if run_heartbeat(Arc::clone(&session), check_interval, timeout, cancel).await
                == HeartbeatResult::TimedOut
            {
                warn!(idle = ?session.idle_for(), "agent unresponsive, closing socket");
                counter!(WS_LIVENESS_TIMEOUTS_TOTAL).increment(1);
                session.close();
            }
        })
    };

    // Inbound frames.
    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            () = closed.cancelled() => break,
            () = shutdown.cancelled() => {
                debug!("server shutting down, closing agent socket");
                break;
            }
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    warn!(len = data.len(), "dropping non-UTF8 binary frame");
                    continue;
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                session.touch();
                continue;
            }
            Some(Ok(Message::Close(_))) => {
                debug!("agent sent close frame");
                break;
            }
            Some(Err(error)) => {
                debug!(%error, "agent socket error");
                break;
            }
            None => break,
        };

        relay.handle_agent_frame(&session, &text).await;
    }

    relay.detach(&session).await;
    watchdog.abort();
    if tokio::time::timeout(OUTBOUND_DRAIN, &mut outbound).await.is_err() {
        outbound.abort();
    }

    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection_start.elapsed().as_secs_f64());
    info!(dropped_frames = session.drop_count(), "agent disconnected");
}
