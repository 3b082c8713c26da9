//! Request/response correlation.
//!
//! Each dispatched command gets a fresh [`RequestId`] and a pending entry
//! holding a oneshot slot. Resolve, reject, the caller's own deadline timer
//! and the background sweeper all settle an entry by *removing* it from the
//! map; only the one that actually removed it may send into the slot. That
//! single removal is what makes every outcome observable exactly once.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::{counter, gauge};
use tether_core::{CallResult, RelayError, RequestId, UserId};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metrics::{
    RELAY_DUPLICATES_SUPPRESSED_TOTAL, RELAY_PENDING_REQUESTS, RELAY_REQUESTS_EXPIRED_TOTAL,
};

/// What happened to a settlement attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Settled {
    /// This call settled the request.
    Delivered,
    /// The request had already settled (or never existed); nothing happened.
    Suppressed,
}

struct PendingRequest {
    user_id: UserId,
    issued_at: Instant,
    deadline: Instant,
    timeout: Duration,
    slot: oneshot::Sender<CallResult>,
}

/// Table of in-flight requests on this process.
#[derive(Default)]
pub struct Correlator {
    pending: DashMap<RequestId, PendingRequest>,
}

impl Correlator {
    /// Create an empty correlator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a request id and a handle to wait on.
    pub fn create(
        self: &Arc<Self>,
        user_id: &UserId,
        timeout: Duration,
    ) -> (RequestId, PendingCall) {
        let request_id = RequestId::new();
        let (slot, rx) = oneshot::channel();
        let issued_at = Instant::now();
        let deadline = issued_at + timeout;
        let _ = self.pending.insert(
            request_id.clone(),
            PendingRequest {
                user_id: user_id.clone(),
                issued_at,
                deadline,
                timeout,
                slot,
            },
        );
        self.record_pending();

        let call = PendingCall {
            request_id: request_id.clone(),
            deadline,
            rx,
            correlator: Arc::clone(self),
            finished: false,
        };
        (request_id, call)
    }

    /// Settle a request with the agent's answer (which may itself be an error).
    pub fn resolve(&self, request_id: &RequestId, result: CallResult) -> Settled {
        match self.pending.remove(request_id) {
            Some((_, pending)) => {
                debug!(
                    %request_id,
                    user_id = %pending.user_id,
                    elapsed_ms = duration_ms(pending.issued_at.elapsed()),
                    ok = result.is_ok(),
                    "request settled"
                );
                // The waiter may already be gone (caller cancelled); nothing to do then.
                let _ = pending.slot.send(result);
                self.record_pending();
                Settled::Delivered
            }
            None => {
                let suppressed = RelayError::DuplicateSuppressed {
                    request_id: request_id.clone(),
                };
                debug!(error = %suppressed, "late settlement discarded");
                counter!(RELAY_DUPLICATES_SUPPRESSED_TOTAL).increment(1);
                Settled::Suppressed
            }
        }
    }

    /// Settle a request with a failure.
    pub fn reject(&self, request_id: &RequestId, error: RelayError) -> Settled {
        self.resolve(request_id, Err(error))
    }

    /// Settle a request as timed out.
    pub fn expire(&self, request_id: &RequestId) -> Settled {
        let timeout_ms = match self.pending.get(request_id) {
            Some(entry) => duration_ms(entry.timeout),
            None => return Settled::Suppressed,
        };
        let settled = self.reject(
            request_id,
            RelayError::Timeout {
                request_id: request_id.clone(),
                timeout_ms,
            },
        );
        if settled == Settled::Delivered {
            counter!(RELAY_REQUESTS_EXPIRED_TOTAL).increment(1);
        }
        settled
    }

    /// Expire every request whose deadline is at or before `now`.
    ///
    /// Returns how many this sweep expired.
    pub fn sweep(&self, now: Instant) -> usize {
        let overdue: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();
        overdue
            .iter()
            .filter(|id| self.expire(id) == Settled::Delivered)
            .count()
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let correlator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired = correlator.sweep(Instant::now());
                        if expired > 0 {
                            debug!(expired, "sweeper expired overdue requests");
                        }
                    }
                    () = cancel.cancelled() => break,
                }
            }
        })
    }

    /// Reject every pending request with a clone of `error`.
    pub fn reject_all(&self, error: &RelayError) -> usize {
        let ids: Vec<RequestId> = self.pending.iter().map(|e| e.key().clone()).collect();
        let rejected = ids
            .iter()
            .filter(|id| self.reject(id, error.clone()) == Settled::Delivered)
            .count();
        if rejected > 0 {
            info!(rejected, kind = %error.kind(), "rejected all pending requests");
        }
        rejected
    }

    /// Whether `request_id` is still pending.
    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.pending.contains_key(request_id)
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn forget(&self, request_id: &RequestId) {
        if self.pending.remove(request_id).is_some() {
            debug!(%request_id, "caller abandoned pending request");
            self.record_pending();
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_pending(&self) {
        gauge!(RELAY_PENDING_REQUESTS).set(self.pending.len() as f64);
    }
}

/// Caller-side handle for one pending request.
///
/// Dropping it before it settles removes the entry, so an abandoned call
/// leaves nothing behind.
pub struct PendingCall {
    request_id: RequestId,
    deadline: Instant,
    rx: oneshot::Receiver<CallResult>,
    correlator: Arc<Correlator>,
    finished: bool,
}

impl PendingCall {
    /// Id allocated for this request.
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// When the request expires.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Suspend until the request is resolved, rejected or expired.
    pub async fn wait(mut self) -> CallResult {
        let settled = tokio::select! {
            biased;
            result = &mut self.rx => Some(result),
            () = tokio::time::sleep_until(self.deadline) => None,
        };
        let result = match settled {
            Some(result) => result,
            None => {
                // Whoever removed the entry first has sent (or is sending) the outcome.
                let _ = self.correlator.expire(&self.request_id);
                (&mut self.rx).await
            }
        };
        self.finished = true;
        result.unwrap_or_else(|_| {
            Err(RelayError::internal(
                "pending request dropped without an outcome",
            ))
        })
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.finished {
            self.correlator.forget(&self.request_id);
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis() as u64
}
