//! Cross-process forwarding channel.
//!
//! Each instance subscribes to its own address (its [`ServerInstanceId`]).
//! A caller on one instance reaches an agent socket held by another by
//! publishing [`BusMessage::Deliver`] to the owner; the owner publishes the
//! agent's answer back to the origin as [`BusMessage::Reply`].

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tether_core::{Envelope, Outcome, RelayError, RequestId, ServerInstanceId, UserId};
use tokio::sync::mpsc;

/// Per-instance subscription buffer.
pub const BUS_CAPACITY: usize = 1024;

/// One message between relay instances.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum BusMessage {
    /// Write `envelope` to `user_id`'s socket on the receiving instance.
    Deliver {
        /// Instance where the caller is waiting.
        origin: ServerInstanceId,
        /// Target user.
        user_id: UserId,
        /// Outbound command, already carrying its request id.
        envelope: Envelope,
        /// Caller's deadline, so the owner can prune its bookkeeping.
        timeout_ms: u64,
    },
    /// The outcome of a forwarded request, for the origin's correlator.
    Reply {
        /// Request being answered.
        request_id: RequestId,
        /// Agent answer or delivery failure.
        outcome: Outcome,
    },
    /// `owner` now holds `user_id`'s socket; the receiver should close its own.
    Evict {
        /// User whose agent reconnected elsewhere.
        user_id: UserId,
        /// The new owner.
        owner: ServerInstanceId,
    },
}

impl BusMessage {
    /// Short name for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Deliver { .. } => "deliver",
            Self::Reply { .. } => "reply",
            Self::Evict { .. } => "evict",
        }
    }
}

/// Addressed pub/sub between relay instances.
#[async_trait]
pub trait RelayBus: Send + Sync {
    /// Send `message` to `target`.
    ///
    /// Fails with `Transport` when the target has no live subscription.
    async fn publish(
        &self,
        target: &ServerInstanceId,
        message: BusMessage,
    ) -> Result<(), RelayError>;

    /// Start receiving messages addressed to `instance`.
    async fn subscribe(
        &self,
        instance: &ServerInstanceId,
    ) -> Result<mpsc::Receiver<BusMessage>, RelayError>;
}

/// In-process bus: one channel per subscribed instance.
#[derive(Clone, Default)]
pub struct MemoryBus {
    subscribers: Arc<DashMap<ServerInstanceId, mpsc::Sender<BusMessage>>>,
}

impl MemoryBus {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of subscribed instances.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[async_trait]
impl RelayBus for MemoryBus {
    async fn publish(
        &self,
        target: &ServerInstanceId,
        message: BusMessage,
    ) -> Result<(), RelayError> {
        let sender = self
            .subscribers
            .get(target)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RelayError::transport(format!("instance {target} is not reachable")))?;

        if sender.send(message).await.is_err() {
            let _ = self
                .subscribers
                .remove_if(target, |_, current| current.same_channel(&sender));
            return Err(RelayError::transport(format!("instance {target} is gone")));
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        instance: &ServerInstanceId,
    ) -> Result<mpsc::Receiver<BusMessage>, RelayError> {
        let (tx, rx) = mpsc::channel(BUS_CAPACITY);
        let _ = self.subscribers.insert(instance.clone(), tx);
        Ok(rx)
    }
}
