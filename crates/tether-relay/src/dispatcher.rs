//! Caller entry point: run a command on a user's agent and wait for the answer.

use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::Value;
use tether_core::{BrowserCommand, CallResult, Command, RelayError, UserId};
use tracing::{Instrument, debug, info_span};

use crate::bus::BusMessage;
use crate::metrics::{
    BUS_MESSAGES_TOTAL, RELAY_CALL_DURATION_SECONDS, RELAY_CALL_OUTCOMES_TOTAL, RELAY_CALLS_TOTAL,
};
use crate::relay::Relay;

impl Relay {
    /// Dispatch `command` to `user_id`'s agent and wait for its reply.
    ///
    /// Fails fast with `NotConnected` when no instance holds the user's
    /// socket, and with `MalformedRequest` when the command's shape is wrong.
    /// Otherwise the caller is suspended until the agent answers, the socket
    /// fails, or the deadline (`timeout_ms`, clamped; default when `None`)
    /// passes. The relay never retries.
    pub async fn call(
        &self,
        user_id: &UserId,
        command: Command,
        timeout_ms: Option<u64>,
    ) -> CallResult {
        command.validate()?;
        let timeout = self.config.resolve_timeout(timeout_ms);

        let owner = self
            .registry
            .lookup(user_id)
            .await?
            .ok_or_else(|| RelayError::not_connected(user_id))?;

        let (request_id, pending) = self.correlator.create(user_id, timeout);
        let local = owner == self.instance_id;
        let span = info_span!(
            "dispatch",
            user_id = %user_id,
            request_id = %request_id,
            command = command.label(),
            owner = %owner,
        );

        async move {
            let started = Instant::now();
            let envelope = command.into_envelope(request_id.clone());
            counter!(RELAY_CALLS_TOTAL, "route" => if local { "local" } else { "forwarded" })
                .increment(1);

            let delivered = if local {
                self.deliver_local(user_id, &self.instance_id, envelope, timeout)
            } else {
                let message = BusMessage::Deliver {
                    origin: self.instance_id.clone(),
                    user_id: user_id.clone(),
                    envelope,
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                };
                counter!(BUS_MESSAGES_TOTAL, "kind" => "deliver", "direction" => "out")
                    .increment(1);
                self.bus.publish(&owner, message).await
            };

            let result = match delivered {
                Ok(()) => pending.wait().await,
                Err(error) => Err(error),
            };

            if local {
                if let Some(session) = self.sessions.get(user_id) {
                    let _ = session.untrack(&request_id);
                }
            }

            let outcome = match &result {
                Ok(_) => "ok",
                Err(error) => error.kind().as_str(),
            };
            counter!(RELAY_CALL_OUTCOMES_TOTAL, "outcome" => outcome).increment(1);
            histogram!(RELAY_CALL_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
            debug!(outcome, "call settled");
            result
        }
        .instrument(span)
        .await
    }

    /// Invoke a named tool.
    pub async fn call_tool(
        &self,
        user_id: &UserId,
        tool: &str,
        params: Value,
        timeout_ms: Option<u64>,
    ) -> CallResult {
        self.call(user_id, Command::tool(tool, params), timeout_ms).await
    }

    /// Run a browser-automation command.
    pub async fn browser(
        &self,
        user_id: &UserId,
        command: BrowserCommand,
        timeout_ms: Option<u64>,
    ) -> CallResult {
        self.call(user_id, Command::Browser(command), timeout_ms).await
    }
}
