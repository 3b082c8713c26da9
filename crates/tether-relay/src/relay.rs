//! The relay node: one per process.
//!
//! Owns this process's [`SessionTable`] and [`Correlator`] and talks to the
//! shared [`AgentRegistry`] and [`RelayBus`]. Session lifecycle and inbound
//! agent traffic live here; the caller-facing entry point is in
//! [`dispatcher`](crate::dispatcher).

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use tether_core::{CallResult, Envelope, RelayError, RequestId, ServerInstanceId, UserId};
use tether_settings::RelaySettings;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::bus::{BusMessage, RelayBus};
use crate::correlator::{Correlator, Settled};
use crate::metrics::{
    AGENT_MALFORMED_FRAMES_TOTAL, AGENT_SESSIONS_ACTIVE, AGENT_SESSIONS_REPLACED_TOTAL,
    AGENT_SESSIONS_TOTAL, BUS_MESSAGES_TOTAL, BUS_RESUBSCRIBES_TOTAL,
};
use crate::registry::AgentRegistry;
use crate::session::AgentSession;
use crate::sessions::SessionTable;

/// How often local users' registry entries are re-claimed.
const DEFAULT_REGISTRY_REFRESH: Duration = Duration::from_secs(20);

/// First wait before re-subscribing to a bus that dropped us.
const RESUBSCRIBE_BACKOFF_MIN: Duration = Duration::from_millis(100);
/// Longest wait between re-subscription attempts.
const RESUBSCRIBE_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Dispatch tuning.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Deadline when the caller gives none.
    pub default_timeout: Duration,
    /// Upper bound for caller deadlines.
    pub max_timeout: Duration,
    /// Correlator sweep period.
    pub sweep_interval: Duration,
    /// Outbound frame queue per agent socket.
    pub send_queue: usize,
    /// Period of the task that re-claims registry entries for local users.
    pub registry_refresh: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_settings(&RelaySettings::default())
    }
}

impl RelayConfig {
    /// Build from the `relay` settings section.
    pub fn from_settings(settings: &RelaySettings) -> Self {
        Self {
            default_timeout: Duration::from_millis(settings.default_timeout_ms),
            max_timeout: Duration::from_millis(settings.max_timeout_ms),
            sweep_interval: Duration::from_millis(settings.sweep_interval_ms),
            send_queue: settings.send_queue.max(1),
            registry_refresh: DEFAULT_REGISTRY_REFRESH,
        }
    }

    /// Refresh registry entries often enough that one living for `ttl`
    /// never lapses under a live socket.
    #[must_use]
    pub fn with_registry_ttl(mut self, ttl: Duration) -> Self {
        self.registry_refresh = (ttl / 3).max(Duration::from_millis(10));
        self
    }

    /// Effective deadline for a caller-supplied timeout.
    ///
    /// `None` means the default; anything else is clamped to
    /// `[1ms, max_timeout]`.
    pub fn resolve_timeout(&self, timeout_ms: Option<u64>) -> Duration {
        match timeout_ms {
            None => self.default_timeout,
            Some(ms) => Duration::from_millis(ms.max(1)).min(self.max_timeout),
        }
    }
}

/// One relay instance.
pub struct Relay {
    pub(crate) instance_id: ServerInstanceId,
    pub(crate) sessions: SessionTable,
    pub(crate) registry: Arc<dyn AgentRegistry>,
    pub(crate) correlator: Arc<Correlator>,
    pub(crate) bus: Arc<dyn RelayBus>,
    pub(crate) config: RelayConfig,
    lifetimes: TaskTracker,
}

impl Relay {
    /// Create a relay instance.
    pub fn new(
        instance_id: ServerInstanceId,
        registry: Arc<dyn AgentRegistry>,
        bus: Arc<dyn RelayBus>,
        config: RelayConfig,
    ) -> Self {
        Self {
            instance_id,
            sessions: SessionTable::new(),
            registry,
            correlator: Arc::new(Correlator::new()),
            bus,
            config,
            lifetimes: TaskTracker::new(),
        }
    }

    /// This instance's address on the bus.
    pub fn instance_id(&self) -> &ServerInstanceId {
        &self.instance_id
    }

    /// Dispatch tuning.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// The correlator, for diagnostics.
    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Local session for a user, if this instance holds it.
    pub fn session(&self, user_id: &UserId) -> Option<Arc<AgentSession>> {
        self.sessions.get(user_id)
    }

    /// Users with a socket on this instance.
    pub fn connected_users(&self) -> Vec<UserId> {
        self.sessions.user_ids()
    }

    /// Live sockets on this instance.
    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    /// Requests waiting for a reply on this instance.
    pub fn pending_count(&self) -> usize {
        self.correlator.len()
    }

    /// Whether any instance holds a socket for `user_id`.
    pub async fn is_connected(&self, user_id: &UserId) -> Result<bool, RelayError> {
        self.registry.is_connected(user_id).await
    }

    /// Instance holding `user_id`'s socket.
    pub async fn owner_of(
        &self,
        user_id: &UserId,
    ) -> Result<Option<ServerInstanceId>, RelayError> {
        self.registry.lookup(user_id).await
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Subscribe to this instance's bus address and spawn the bus consumer,
    /// the correlator sweeper and the registry refresher. All three stop
    /// when `cancel` fires.
    pub async fn start(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<Vec<JoinHandle<()>>, RelayError> {
        let rx = self.bus.subscribe(&self.instance_id).await?;
        let bus_task = tokio::spawn(Arc::clone(self).run_bus(rx, cancel.clone()));
        let sweeper = self
            .correlator
            .spawn_sweeper(self.config.sweep_interval, cancel.clone());
        let refresher = tokio::spawn(Arc::clone(self).run_registry_refresh(cancel));
        info!(instance_id = %self.instance_id, "relay started");
        Ok(vec![bus_task, sweeper, refresher])
    }

    /// Reject every pending request and close every local socket.
    pub fn shutdown(&self) {
        let rejected = self
            .correlator
            .reject_all(&RelayError::transport("relay is shutting down"));
        let sessions = self.sessions.all();
        for session in &sessions {
            session.close();
        }
        info!(rejected, closed = sessions.len(), "relay shut down");
    }

    /// [`shutdown`](Self::shutdown), then wait until every session has been
    /// detached and its registry entry removed.
    ///
    /// Connection tasks get up to `timeout` to detach on their own; whatever
    /// is left after that is detached here.
    pub async fn drain(&self, timeout: Duration) {
        self.shutdown();
        let _ = self.lifetimes.close();
        if tokio::time::timeout(timeout, self.lifetimes.wait())
            .await
            .is_ok()
        {
            debug!("all agent sessions detached");
            return;
        }
        let stragglers = self.sessions.all();
        warn!(
            remaining = stragglers.len(),
            "agent sessions still open after {timeout:?}, detaching them"
        );
        for session in &stragglers {
            self.detach(session).await;
        }
    }

    /// Sessions attached and not yet detached, including ones mid-teardown.
    pub fn live_session_count(&self) -> usize {
        self.lifetimes.len()
    }

    // ── Sessions ────────────────────────────────────────────────────────

    /// Establish a session for an authenticated agent socket.
    ///
    /// The `connected` handshake is queued before anything else can be. A
    /// previous local session for the same user is closed; a previous owner
    /// elsewhere is told to close its socket.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn attach(
        &self,
        user_id: UserId,
        platform: impl Into<String>,
    ) -> Result<(Arc<AgentSession>, mpsc::Receiver<String>), RelayError> {
        let (tx, rx) = mpsc::channel(self.config.send_queue);
        let session = Arc::new(AgentSession::new(
            user_id.clone(),
            self.instance_id.clone(),
            platform,
            tx,
        ));
        session.deliver(&Envelope::connected(&user_id))?;
        session.hold(self.lifetimes.token());

        if let Some(previous) = self.sessions.insert(Arc::clone(&session)) {
            info!(
                old_connection = %previous.connection_id(),
                "agent reconnected, closing previous socket"
            );
            counter!(AGENT_SESSIONS_REPLACED_TOTAL).increment(1);
            previous.close();
        }

        let previous_owner = match self.registry.register(&user_id, &self.instance_id).await {
            Ok(previous_owner) => previous_owner,
            Err(error) => {
                let _ = self
                    .sessions
                    .remove_if_current(&user_id, session.connection_id());
                session.close();
                warn!(%error, "failed to register agent session");
                return Err(error);
            }
        };

        if let Some(owner) = previous_owner.filter(|owner| *owner != self.instance_id) {
            info!(previous_owner = %owner, "agent moved from another instance");
            let evict = BusMessage::Evict {
                user_id: user_id.clone(),
                owner: self.instance_id.clone(),
            };
            if let Err(error) = self.bus.publish(&owner, evict).await {
                warn!(%error, previous_owner = %owner, "could not notify previous owner");
            }
        }

        counter!(AGENT_SESSIONS_TOTAL).increment(1);
        self.record_sessions();
        info!(
            connection_id = %session.connection_id(),
            platform = session.platform(),
            "agent session established"
        );
        Ok((session, rx))
    }

    /// Tear down a session after its socket closed.
    ///
    /// Removes the local entry and the registry entry only if they still
    /// belong to this socket, then fails every request still in flight on it.
    #[instrument(
        skip_all,
        fields(user_id = %session.user_id(), connection_id = %session.connection_id())
    )]
    pub async fn detach(&self, session: &Arc<AgentSession>) {
        session.close();

        let was_current = self
            .sessions
            .remove_if_current(session.user_id(), session.connection_id());
        if was_current {
            match self
                .registry
                .unregister(session.user_id(), &self.instance_id)
                .await
            {
                Ok(true) => {}
                Ok(false) => debug!("registry entry already owned elsewhere"),
                Err(error) => warn!(%error, "failed to unregister agent session"),
            }
        }

        let in_flight = session.drain_in_flight();
        let failed = in_flight.len();
        for (request_id, origin) in in_flight {
            let error = RelayError::transport("agent connection closed before responding");
            self.settle(&origin, &request_id, Err(error)).await;
        }

        self.record_sessions();
        info!(
            failed_requests = failed,
            dropped_frames = session.drop_count(),
            "agent session closed"
        );
        session.release();
    }

    // ── Agent traffic ───────────────────────────────────────────────────

    /// Process one text frame from an agent.
    ///
    /// Frames that fail to decode, or replies to requests not in flight on
    /// this socket, are logged and dropped.
    pub async fn handle_agent_frame(&self, session: &AgentSession, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(error) => {
                counter!(AGENT_MALFORMED_FRAMES_TOTAL).increment(1);
                warn!(user_id = %session.user_id(), %error, "dropping malformed agent frame");
                return;
            }
        };
        session.touch();

        match envelope {
            Envelope::Heartbeat { .. } => {
                if let Err(error) = session.deliver(&Envelope::heartbeat_ack()) {
                    debug!(user_id = %session.user_id(), %error, "heartbeat_ack not queued");
                }
            }
            reply if reply.is_reply() => {
                let Some((request_id, result)) = reply.into_outcome() else {
                    return;
                };
                match session.untrack(&request_id) {
                    Some(origin) => self.settle(&origin, &request_id, result).await,
                    None => debug!(
                        user_id = %session.user_id(),
                        %request_id,
                        "reply for a request not in flight on this socket, discarding"
                    ),
                }
            }
            other => {
                debug!(
                    user_id = %session.user_id(),
                    envelope_type = other.type_name(),
                    "ignoring unexpected envelope from agent"
                );
            }
        }
    }

    /// Route an outcome to the correlator that is waiting for it.
    pub(crate) async fn settle(
        &self,
        origin: &ServerInstanceId,
        request_id: &RequestId,
        result: CallResult,
    ) {
        if *origin == self.instance_id {
            if self.correlator.resolve(request_id, result) == Settled::Suppressed {
                debug!(%request_id, "outcome arrived after the request settled");
            }
            return;
        }
        let reply = BusMessage::Reply {
            request_id: request_id.clone(),
            outcome: result.into(),
        };
        counter!(BUS_MESSAGES_TOTAL, "kind" => "reply", "direction" => "out").increment(1);
        if let Err(error) = self.bus.publish(origin, reply).await {
            warn!(%error, %request_id, %origin, "could not return outcome to origin");
        }
    }

    // ── Registry refresh ────────────────────────────────────────────────

    /// Re-claim this instance's registry entries every
    /// `registry_refresh` until `cancel` fires, so backends that expire
    /// entries keep them only while the socket lives.
    pub async fn run_registry_refresh(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.registry_refresh);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let _ = ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.refresh_registrations().await,
                () = cancel.cancelled() => break,
            }
        }
        debug!(instance_id = %self.instance_id, "registry refresher stopped");
    }

    /// Extend every local session's registry entry once.
    ///
    /// An entry that lapsed under a live socket is written again; one that
    /// another instance took over is left alone, its `Evict` closes ours.
    pub async fn refresh_registrations(&self) {
        for session in self.sessions.all() {
            let user_id = session.user_id();
            match self.registry.refresh(user_id, &self.instance_id).await {
                Ok(true) => {}
                Ok(false) => self.reclaim(&session).await,
                Err(error) => warn!(%user_id, %error, "failed to refresh registry entry"),
            }
        }
    }

    async fn reclaim(&self, session: &AgentSession) {
        let user_id = session.user_id();
        let still_current = self
            .sessions
            .get(user_id)
            .is_some_and(|current| current.connection_id() == session.connection_id());
        if !still_current || session.is_closed() {
            return;
        }
        match self.registry.lookup(user_id).await {
            Ok(None) => {
                warn!(%user_id, "registry entry lapsed under a live socket, re-registering");
                if let Err(error) = self.registry.register(user_id, &self.instance_id).await {
                    warn!(%user_id, %error, "failed to re-register agent session");
                }
            }
            Ok(Some(owner)) => debug!(%user_id, %owner, "registry entry owned elsewhere"),
            Err(error) => warn!(%user_id, %error, "registry lookup failed"),
        }
    }

    // ── Bus ─────────────────────────────────────────────────────────────

    /// Consume this instance's bus subscription until `cancel` fires.
    ///
    /// A subscription that ends is re-established with backoff. Handling
    /// that has to wait on the registry or the bus runs in its own task, so
    /// one slow round trip never holds up other users' traffic.
    pub async fn run_bus(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<BusMessage>,
        cancel: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                message = rx.recv() => message,
                () = cancel.cancelled() => break,
            };
            let Some(message) = message else {
                warn!(instance_id = %self.instance_id, "bus subscription closed, re-subscribing");
                match self.resubscribe(&cancel).await {
                    Some(fresh) => {
                        rx = fresh;
                        continue;
                    }
                    None => break,
                }
            };
            counter!(BUS_MESSAGES_TOTAL, "kind" => message.kind(), "direction" => "in")
                .increment(1);
            self.handle_bus_message(message);
        }
        debug!(instance_id = %self.instance_id, "bus consumer stopped");
    }

    /// Subscribe again, backing off between failures. `None` once cancelled.
    async fn resubscribe(
        &self,
        cancel: &CancellationToken,
    ) -> Option<mpsc::Receiver<BusMessage>> {
        let mut backoff = RESUBSCRIBE_BACKOFF_MIN;
        loop {
            tokio::select! {
                () = tokio::time::sleep(backoff) => {}
                () = cancel.cancelled() => return None,
            }
            match self.bus.subscribe(&self.instance_id).await {
                Ok(rx) => {
                    counter!(BUS_RESUBSCRIBES_TOTAL).increment(1);
                    info!(instance_id = %self.instance_id, "bus subscription restored");
                    return Some(rx);
                }
                Err(error) => {
                    warn!(%error, retry_in = ?backoff, "bus re-subscription failed");
                    backoff = (backoff * 2).min(RESUBSCRIBE_BACKOFF_MAX);
                }
            }
        }
    }

    fn handle_bus_message(self: &Arc<Self>, message: BusMessage) {
        match message {
            BusMessage::Deliver {
                origin,
                user_id,
                envelope,
                timeout_ms,
            } => {
                let Some(request_id) = envelope.request_id().cloned() else {
                    warn!(
                        %origin,
                        envelope_type = envelope.type_name(),
                        "forwarded envelope has no request id"
                    );
                    return;
                };
                let timeout = Duration::from_millis(timeout_ms);
                if let Err(error) = self.deliver_local(&user_id, &origin, envelope, timeout) {
                    debug!(%request_id, %error, "forwarded delivery failed");
                    let relay = Arc::clone(self);
                    drop(tokio::spawn(async move {
                        relay.settle(&origin, &request_id, Err(error)).await;
                    }));
                }
            }
            BusMessage::Reply {
                request_id,
                outcome,
            } => {
                if self.correlator.resolve(&request_id, outcome.into()) == Settled::Suppressed {
                    debug!(%request_id, "forwarded reply arrived after the request settled");
                }
            }
            BusMessage::Evict { user_id, owner } => {
                let relay = Arc::clone(self);
                drop(tokio::spawn(async move {
                    relay.evict(&user_id, &owner).await;
                }));
            }
        }
    }

    async fn evict(&self, user_id: &UserId, new_owner: &ServerInstanceId) {
        let Some(session) = self.sessions.get(user_id) else {
            return;
        };
        // A later reconnect to this instance makes the notice stale.
        if let Ok(Some(current)) = self.registry.lookup(user_id).await {
            if current == self.instance_id {
                debug!(%user_id, "ignoring stale eviction");
                return;
            }
        }
        info!(%user_id, %new_owner, "agent reconnected elsewhere, closing local socket");
        counter!(AGENT_SESSIONS_REPLACED_TOTAL).increment(1);
        session.close();
    }

    /// Write an envelope to a local socket, remembering who waits for it.
    pub(crate) fn deliver_local(
        &self,
        user_id: &UserId,
        origin: &ServerInstanceId,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<(), RelayError> {
        let session = self
            .sessions
            .get(user_id)
            .filter(|session| !session.is_closed())
            .ok_or_else(|| RelayError::not_connected(user_id))?;
        let request_id = envelope
            .request_id()
            .cloned()
            .ok_or_else(|| RelayError::internal("outbound envelope has no request id"))?;

        session.track(request_id.clone(), origin.clone(), timeout);
        if let Err(error) = session.deliver(&envelope) {
            let _ = session.untrack(&request_id);
            return Err(error);
        }
        Ok(())
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_sessions(&self) {
        gauge!(AGENT_SESSIONS_ACTIVE).set(self.sessions.len() as f64);
    }
}
