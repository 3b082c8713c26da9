//! One live agent socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use tether_core::{ConnectionId, Envelope, RelayError, RequestId, ServerInstanceId, UserId};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tracing::warn;

use crate::metrics::AGENT_FRAMES_DROPPED_TOTAL;

/// A request written to this socket whose reply has not arrived yet.
#[derive(Clone, Debug)]
struct InFlight {
    /// Process where the caller is waiting.
    origin: ServerInstanceId,
    /// After this the origin has given up; the entry is only kept for pruning.
    deadline: Instant,
}

/// A live agent connection owned by this process.
///
/// The socket itself lives in the server's connection task; the session is
/// the handle everything else uses to reach it: a bounded outbound queue, a
/// close signal and the bookkeeping of requests written to it.
pub struct AgentSession {
    user_id: UserId,
    connection_id: ConnectionId,
    instance_id: ServerInstanceId,
    platform: String,
    established_at: DateTime<Utc>,
    last_heartbeat: Mutex<Instant>,
    tx: mpsc::Sender<String>,
    dropped_frames: AtomicU64,
    closed: CancellationToken,
    in_flight: Mutex<HashMap<RequestId, InFlight>>,
    lifetime: Mutex<Option<TaskTrackerToken>>,
}

impl AgentSession {
    /// Create a session writing to `tx`.
    pub fn new(
        user_id: UserId,
        instance_id: ServerInstanceId,
        platform: impl Into<String>,
        tx: mpsc::Sender<String>,
    ) -> Self {
        Self {
            user_id,
            connection_id: ConnectionId::new(),
            instance_id,
            platform: platform.into(),
            established_at: Utc::now(),
            last_heartbeat: Mutex::new(Instant::now()),
            tx,
            dropped_frames: AtomicU64::new(0),
            closed: CancellationToken::new(),
            in_flight: Mutex::new(HashMap::new()),
            lifetime: Mutex::new(None),
        }
    }

    /// User this agent acts for.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Identity of this particular socket.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Process holding the socket.
    pub fn instance_id(&self) -> &ServerInstanceId {
        &self.instance_id
    }

    /// Agent platform label from its credential.
    pub fn platform(&self) -> &str {
        &self.platform
    }

    /// When the socket was accepted.
    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    // ── Outbound ────────────────────────────────────────────────────────

    /// Queue a raw text frame.
    ///
    /// Returns `false` if the queue is full or closed, and increments the
    /// dropped frame counter.
    pub fn send(&self, frame: String) -> bool {
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            self.record_drop();
            false
        }
    }

    /// Encode and queue an envelope.
    ///
    /// Unlike [`send`](Self::send), the reason for a failure is reported so a
    /// dispatch can fail fast instead of waiting out its deadline.
    pub fn deliver(&self, envelope: &Envelope) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::transport("agent connection is closing"));
        }
        let frame = envelope
            .encode()
            .map_err(|e| RelayError::internal(e.to_string()))?;
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.record_drop();
                warn!(user_id = %self.user_id, "agent send queue full");
                Err(RelayError::transport("agent send queue is full"))
            }
            Err(TrySendError::Closed(_)) => {
                self.record_drop();
                Err(RelayError::transport("agent connection closed"))
            }
        }
    }

    fn record_drop(&self) {
        let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
        counter!(AGENT_FRAMES_DROPPED_TOTAL).increment(1);
    }

    /// Total frames dropped for this socket.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    // ── Liveness ────────────────────────────────────────────────────────

    /// Record a sign of life (heartbeat, ping or pong).
    pub fn touch(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    /// Time since the last sign of life, or since establishment.
    pub fn idle_for(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    // ── Close signal ────────────────────────────────────────────────────

    /// Keep `token` until [`release`](Self::release), so whoever waits on
    /// the tracker waits for this session's teardown.
    pub(crate) fn hold(&self, token: TaskTrackerToken) {
        *self.lifetime.lock() = Some(token);
    }

    /// Drop the token taken in [`hold`](Self::hold).
    pub(crate) fn release(&self) {
        drop(self.lifetime.lock().take());
    }

    /// Ask the connection task to close the socket. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled when the session is closed.
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    // ── In-flight requests ──────────────────────────────────────────────

    /// Remember that `request_id` was written to this socket for a caller on
    /// `origin`. Entries past their deadline are pruned on the way.
    pub fn track(&self, request_id: RequestId, origin: ServerInstanceId, timeout: Duration) {
        let now = Instant::now();
        let mut in_flight = self.in_flight.lock();
        in_flight.retain(|_, entry| entry.deadline > now);
        let _ = in_flight.insert(
            request_id,
            InFlight {
                origin,
                deadline: now + timeout,
            },
        );
    }

    /// Forget a request, returning the process waiting for it.
    pub fn untrack(&self, request_id: &RequestId) -> Option<ServerInstanceId> {
        self.in_flight
            .lock()
            .remove(request_id)
            .map(|entry| entry.origin)
    }

    /// Take every in-flight request, leaving none.
    pub fn drain_in_flight(&self) -> Vec<(RequestId, ServerInstanceId)> {
        self.in_flight
            .lock()
            .drain()
            .map(|(id, entry)| (id, entry.origin))
            .collect()
    }

    /// Number of requests written and not yet answered.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("user_id", &self.user_id)
            .field("connection_id", &self.connection_id)
            .field("instance_id", &self.instance_id)
            .field("platform", &self.platform)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn make_session(capacity: usize) -> (AgentSession, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        let session = AgentSession::new(
            UserId::from("u1"),
            ServerInstanceId::from("node-a"),
            "macos",
            tx,
        );
        (session, rx)
    }

    #[test]
    fn accessors() {
        let (session, _rx) = make_session(4);
        assert_eq!(session.user_id().as_str(), "u1");
        assert_eq!(session.instance_id().as_str(), "node-a");
        assert_eq!(session.platform(), "macos");
        assert!(!session.is_closed());
        assert_eq!(session.in_flight_count(), 0);
    }

    #[test]
    fn each_session_gets_its_own_connection_id() {
        let (a, _rx_a) = make_session(1);
        let (b, _rx_b) = make_session(1);
        assert_ne!(a.connection_id(), b.connection_id());
    }

    #[tokio::test]
    async fn deliver_encodes_envelope() {
        let (session, mut rx) = make_session(4);
        session.deliver(&Envelope::heartbeat_ack()).unwrap();
        let frame = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "heartbeat_ack");
    }

    #[test]
    fn deliver_to_full_queue_is_transport_error() {
        let (session, _rx) = make_session(1);
        session.deliver(&Envelope::heartbeat_ack()).unwrap();
        let err = session.deliver(&Envelope::heartbeat_ack()).unwrap_err();
        assert_matches!(err, RelayError::Transport { .. });
        assert_eq!(session.drop_count(), 1);
    }

    #[test]
    fn deliver_to_closed_queue_is_transport_error() {
        let (session, rx) = make_session(4);
        drop(rx);
        let err = session.deliver(&Envelope::heartbeat_ack()).unwrap_err();
        assert_matches!(err, RelayError::Transport { .. });
    }

    #[test]
    fn deliver_after_close_is_transport_error() {
        let (session, _rx) = make_session(4);
        session.close();
        assert!(session.is_closed());
        assert_matches!(
            session.deliver(&Envelope::heartbeat_ack()),
            Err(RelayError::Transport { .. })
        );
    }

    #[test]
    fn send_counts_drops() {
        let (session, _rx) = make_session(1);
        assert!(session.send("a".into()));
        assert!(!session.send("b".into()));
        assert_eq!(session.drop_count(), 1);
    }

    #[tokio::test]
    async fn close_token_fires() {
        let (session, _rx) = make_session(1);
        let token = session.close_token();
        session.close();
        token.cancelled().await;
        session.close();
        assert!(session.is_closed());
    }

    #[test]
    fn track_and_untrack() {
        let (session, _rx) = make_session(1);
        let origin = ServerInstanceId::from("node-b");
        session.track(RequestId::from("r1"), origin.clone(), Duration::from_secs(5));
        assert_eq!(session.in_flight_count(), 1);
        assert_eq!(session.untrack(&RequestId::from("r1")), Some(origin));
        assert_eq!(session.untrack(&RequestId::from("r1")), None);
    }

    #[test]
    fn drain_empties_in_flight() {
        let (session, _rx) = make_session(1);
        let origin = ServerInstanceId::from("node-a");
        session.track(RequestId::from("r1"), origin.clone(), Duration::from_secs(5));
        session.track(RequestId::from("r2"), origin, Duration::from_secs(5));
        let mut drained = session.drain_in_flight();
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].0.as_str(), "r1");
        assert_eq!(session.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_pruned_on_track() {
        let (session, _rx) = make_session(1);
        let origin = ServerInstanceId::from("node-b");
        session.track(RequestId::from("old"), origin.clone(), Duration::from_millis(100));
        tokio::time::advance(Duration::from_millis(150)).await;
        session.track(RequestId::from("new"), origin, Duration::from_millis(100));
        assert_eq!(session.in_flight_count(), 1);
        assert!(session.untrack(&RequestId::from("old")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn touch_resets_idle_time() {
        let (session, _rx) = make_session(1);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(session.idle_for() >= Duration::from_secs(10));
        session.touch();
        assert!(session.idle_for() < Duration::from_secs(1));
    }
}
