//! Agent wire protocol.
//!
//! Every frame on an agent socket is one JSON [`Envelope`], tagged by its
//! `"type"` field. Tool invocations, the fixed browser-automation vocabulary,
//! liveness and the handshake all share this one type, so validation and
//! dispatch go through a single decoding path ([`Envelope::decode`]).
//!
//! Callers never build envelopes directly. They describe what they want as a
//! [`Command`], which the dispatcher turns into an envelope once a request id
//! has been allocated.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::errors::RelayError;
use crate::ids::{RequestId, UserId};

/// Result of one dispatched command: the agent's raw payload or a relay error.
pub type CallResult = Result<Value, RelayError>;

/// Failure to decode or encode an envelope.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not a valid envelope (bad JSON, unknown type, missing fields).
    #[error("invalid envelope: {0}")]
    Invalid(#[from] serde_json::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// One frame exchanged with an agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Envelope {
    /// Relay → agent: run a tool. Name and params are opaque to the relay.
    ToolCall {
        /// Correlation id.
        request_id: RequestId,
        /// Tool name.
        tool: String,
        /// Tool parameters (always an object).
        #[serde(default)]
        params: Value,
    },

    /// Agent → relay: reply to exactly one `tool_call`.
    ToolResponse {
        /// Correlation id of the call being answered.
        request_id: RequestId,
        /// Tool result on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        /// Agent-reported failure message.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Relay → agent: open a URL.
    Navigate {
        /// Correlation id.
        request_id: RequestId,
        /// Destination URL.
        url: String,
    },

    /// Relay → agent: read page content.
    GetContent {
        /// Correlation id.
        request_id: RequestId,
        /// Optional CSS selector to narrow the read.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
    },

    /// Relay → agent: capture the visible page.
    Screenshot {
        /// Correlation id.
        request_id: RequestId,
        /// Capture the full scrollable page instead of the viewport.
        #[serde(default)]
        full_page: bool,
    },

    /// Relay → agent: evaluate a script in the page.
    ExecuteScript {
        /// Correlation id.
        request_id: RequestId,
        /// Script source.
        script: String,
    },

    /// Relay → agent: close a tab (the active one when unspecified).
    CloseTab {
        /// Correlation id.
        request_id: RequestId,
        /// Tab to close.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tab_id: Option<String>,
    },

    /// Agent → relay: reply to any browser command.
    ///
    /// Agents may tag it `browser_response` or `<command>_response`.
    #[serde(
        alias = "navigate_response",
        alias = "get_content_response",
        alias = "screenshot_response",
        alias = "execute_script_response",
        alias = "close_tab_response"
    )]
    BrowserResponse {
        /// Correlation id of the command being answered.
        request_id: RequestId,
        /// Whether the command succeeded.
        success: bool,
        /// Agent-reported failure message.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Command-specific payload fields.
        #[serde(flatten)]
        payload: Map<String, Value>,
    },

    /// Agent → relay: liveness signal.
    Heartbeat {
        /// Agent clock, informational.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },

    /// Relay → agent: acknowledges a heartbeat.
    HeartbeatAck {
        /// Relay clock (RFC 3339).
        timestamp: String,
    },

    /// Relay → agent: first frame on every new socket. Informational only.
    Connected {
        /// The user the socket was accepted for.
        user_id: UserId,
        /// Relay clock (RFC 3339).
        timestamp: String,
    },
}

impl Envelope {
    /// Decode one agent frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode for the wire.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Handshake frame sent when a socket opens.
    #[must_use]
    pub fn connected(user_id: &UserId) -> Self {
        Self::Connected {
            user_id: user_id.clone(),
            timestamp: now_rfc3339(),
        }
    }

    /// Acknowledgement for an agent heartbeat.
    #[must_use]
    pub fn heartbeat_ack() -> Self {
        Self::HeartbeatAck {
            timestamp: now_rfc3339(),
        }
    }

    /// Wire name of this envelope's type.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResponse { .. } => "tool_response",
            Self::Navigate { .. } => "navigate",
            Self::GetContent { .. } => "get_content",
            Self::Screenshot { .. } => "screenshot",
            Self::ExecuteScript { .. } => "execute_script",
            Self::CloseTab { .. } => "close_tab",
            Self::BrowserResponse { .. } => "browser_response",
            Self::Heartbeat { .. } => "heartbeat",
            Self::HeartbeatAck { .. } => "heartbeat_ack",
            Self::Connected { .. } => "connected",
        }
    }

    /// Correlation id, for the types that carry one.
    #[must_use]
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Self::ToolCall { request_id, .. }
            | Self::ToolResponse { request_id, .. }
            | Self::Navigate { request_id, .. }
            | Self::GetContent { request_id, .. }
            | Self::Screenshot { request_id, .. }
            | Self::ExecuteScript { request_id, .. }
            | Self::CloseTab { request_id, .. }
            | Self::BrowserResponse { request_id, .. } => Some(request_id),
            Self::Heartbeat { .. } | Self::HeartbeatAck { .. } | Self::Connected { .. } => None,
        }
    }

    /// Whether this is an agent reply that settles a pending request.
    #[must_use]
    pub fn is_reply(&self) -> bool {
        matches!(self, Self::ToolResponse { .. } | Self::BrowserResponse { .. })
    }

    /// Convert an agent reply into its request id and call result.
    ///
    /// Returns `None` for envelopes that are not replies.
    #[must_use]
    pub fn into_outcome(self) -> Option<(RequestId, CallResult)> {
        match self {
            Self::ToolResponse {
                request_id,
                result,
                error,
            } => {
                let outcome = match error {
                    Some(message) => Err(RelayError::tool(message)),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                Some((request_id, outcome))
            }
            Self::BrowserResponse {
                request_id,
                success,
                error,
                mut payload,
            } => {
                let _ = payload.remove("userId");
                let outcome = if success {
                    Ok(Value::Object(payload))
                } else {
                    Err(RelayError::tool(
                        error.unwrap_or_else(|| "browser command failed".to_string()),
                    ))
                };
                Some((request_id, outcome))
            }
            _ => None,
        }
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

/// Fixed browser-automation vocabulary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum BrowserCommand {
    /// Open a URL.
    Navigate {
        /// Destination URL.
        url: String,
    },
    /// Read page content.
    GetContent {
        /// Optional CSS selector.
        #[serde(default)]
        selector: Option<String>,
    },
    /// Capture the page.
    Screenshot {
        /// Full scrollable page instead of the viewport.
        #[serde(default)]
        full_page: bool,
    },
    /// Evaluate a script.
    ExecuteScript {
        /// Script source.
        script: String,
    },
    /// Close a tab.
    CloseTab {
        /// Tab to close.
        #[serde(default)]
        tab_id: Option<String>,
    },
}

/// Something a caller asks a user's agent to do.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Invoke a named tool with object-typed params.
    Tool {
        /// Tool name.
        tool: String,
        /// Tool parameters.
        params: Value,
    },
    /// Run a browser-automation command.
    Browser(BrowserCommand),
}

impl Command {
    /// Tool invocation.
    #[must_use]
    pub fn tool(tool: impl Into<String>, params: Value) -> Self {
        Self::Tool {
            tool: tool.into(),
            params,
        }
    }

    /// Check the command's shape. The relay never looks further than this.
    pub fn validate(&self) -> Result<(), RelayError> {
        match self {
            Self::Tool { tool, params } => {
                if tool.trim().is_empty() {
                    return Err(RelayError::malformed("tool name must be a non-empty string"));
                }
                if !params.is_object() {
                    return Err(RelayError::malformed("params must be an object"));
                }
            }
            Self::Browser(BrowserCommand::Navigate { url }) => {
                if url.trim().is_empty() {
                    return Err(RelayError::malformed("navigate requires a non-empty url"));
                }
            }
            Self::Browser(BrowserCommand::ExecuteScript { script }) => {
                if script.trim().is_empty() {
                    return Err(RelayError::malformed(
                        "execute_script requires a non-empty script",
                    ));
                }
            }
            Self::Browser(_) => {}
        }
        Ok(())
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Tool { tool, .. } => tool,
            Self::Browser(BrowserCommand::Navigate { .. }) => "navigate",
            Self::Browser(BrowserCommand::GetContent { .. }) => "get_content",
            Self::Browser(BrowserCommand::Screenshot { .. }) => "screenshot",
            Self::Browser(BrowserCommand::ExecuteScript { .. }) => "execute_script",
            Self::Browser(BrowserCommand::CloseTab { .. }) => "close_tab",
        }
    }

    /// Build the outbound envelope for an allocated request id.
    #[must_use]
    pub fn into_envelope(self, request_id: RequestId) -> Envelope {
        match self {
            Self::Tool { tool, params } => Envelope::ToolCall {
                request_id,
                tool,
                params,
            },
            Self::Browser(BrowserCommand::Navigate { url }) => {
                Envelope::Navigate { request_id, url }
            }
            Self::Browser(BrowserCommand::GetContent { selector }) => Envelope::GetContent {
                request_id,
                selector,
            },
            Self::Browser(BrowserCommand::Screenshot { full_page }) => Envelope::Screenshot {
                request_id,
                full_page,
            },
            Self::Browser(BrowserCommand::ExecuteScript { script }) => {
                Envelope::ExecuteScript { request_id, script }
            }
            Self::Browser(BrowserCommand::CloseTab { tab_id }) => {
                Envelope::CloseTab { request_id, tab_id }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outcome
// ─────────────────────────────────────────────────────────────────────────────

/// Serialisable form of a [`CallResult`] for the cross-process channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// The agent answered successfully.
    Ok {
        /// Raw agent payload.
        result: Value,
    },
    /// The request failed.
    Err {
        /// Why.
        error: RelayError,
    },
}

impl From<CallResult> for Outcome {
    fn from(result: CallResult) -> Self {
        match result {
            Ok(result) => Self::Ok { result },
            Err(error) => Self::Err { error },
        }
    }
}

impl From<Outcome> for CallResult {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Ok { result } => Ok(result),
            Outcome::Err { error } => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn tool_call_wire_shape() {
        let env = Command::tool("echo", json!({"msg": "hi"})).into_envelope(RequestId::from("r1"));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({"type": "tool_call", "requestId": "r1", "tool": "echo", "params": {"msg": "hi"}})
        );
    }

    #[test]
    fn decode_tool_response_success() {
        let env =
            Envelope::decode(r#"{"type":"tool_response","requestId":"r1","result":{"msg":"hi"}}"#)
                .unwrap();
        let (id, outcome) = env.into_outcome().unwrap();
        assert_eq!(id.as_str(), "r1");
        assert_eq!(outcome.unwrap(), json!({"msg": "hi"}));
    }

    #[test]
    fn decode_tool_response_error_becomes_tool_error() {
        let env =
            Envelope::decode(r#"{"type":"tool_response","requestId":"r2","error":"no such tool"}"#)
                .unwrap();
        let (_, outcome) = env.into_outcome().unwrap();
        assert_matches!(
            outcome,
            Err(RelayError::ToolError { message }) if message == "no such tool"
        );
    }

    #[test]
    fn tool_response_without_result_is_null() {
        let env = Envelope::decode(r#"{"type":"tool_response","requestId":"r3"}"#).unwrap();
        let (_, outcome) = env.into_outcome().unwrap();
        assert_eq!(outcome.unwrap(), Value::Null);
    }

    #[test]
    fn reply_missing_request_id_is_rejected() {
        let err = Envelope::decode(r#"{"type":"tool_response","result":1}"#);
        assert!(err.is_err());
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(Envelope::decode(r#"{"type":"self_destruct","requestId":"r"}"#).is_err());
        assert!(Envelope::decode("not json").is_err());
    }

    #[test]
    fn browser_response_keeps_payload_fields() {
        let env = Envelope::decode(
            r#"{"type":"screenshot_response","requestId":"r4","success":true,"image":"b64","userId":"u1"}"#,
        )
        .unwrap();
        assert_eq!(env.type_name(), "browser_response");
        let (id, outcome) = env.into_outcome().unwrap();
        assert_eq!(id.as_str(), "r4");
        assert_eq!(outcome.unwrap(), json!({"image": "b64"}));
    }

    #[test]
    fn browser_response_failure_carries_message() {
        let env = Envelope::decode(
            r#"{"type":"browser_response","requestId":"r5","success":false,"error":"tab closed"}"#,
        )
        .unwrap();
        let (_, outcome) = env.into_outcome().unwrap();
        assert_matches!(outcome, Err(RelayError::ToolError { message }) if message == "tab closed");
    }

    #[test]
    fn heartbeat_decodes_without_fields() {
        let env = Envelope::decode(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(env, Envelope::Heartbeat { timestamp: None });
        assert!(env.request_id().is_none());
        assert!(!env.is_reply());
        assert!(env.into_outcome().is_none());
    }

    #[test]
    fn connected_frame_shape() {
        let value = serde_json::to_value(Envelope::connected(&UserId::from("u1"))).unwrap();
        assert_eq!(value["type"], "connected");
        assert_eq!(value["userId"], "u1");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn browser_commands_map_to_envelopes() {
        let id = RequestId::from("r6");
        let env = Command::Browser(BrowserCommand::Screenshot { full_page: true })
            .into_envelope(id.clone());
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value, json!({"type": "screenshot", "requestId": "r6", "fullPage": true}));

        let env = Command::Browser(BrowserCommand::CloseTab { tab_id: None }).into_envelope(id);
        assert_eq!(env.type_name(), "close_tab");
    }

    #[test]
    fn browser_command_deserializes_from_caller_json() {
        let cmd: BrowserCommand =
            serde_json::from_value(json!({"type": "execute_script", "script": "1+1"})).unwrap();
        assert_eq!(
            cmd,
            BrowserCommand::ExecuteScript {
                script: "1+1".into()
            }
        );
    }

    #[test]
    fn validate_rejects_bad_shapes() {
        assert_matches!(
            Command::tool("", json!({})).validate(),
            Err(RelayError::MalformedRequest { .. })
        );
        assert_matches!(
            Command::tool("echo", json!([1, 2])).validate(),
            Err(RelayError::MalformedRequest { .. })
        );
        assert_matches!(
            Command::Browser(BrowserCommand::Navigate { url: " ".into() }).validate(),
            Err(RelayError::MalformedRequest { .. })
        );
        assert!(Command::tool("echo", json!({})).validate().is_ok());
        assert!(Command::Browser(BrowserCommand::GetContent { selector: None })
            .validate()
            .is_ok());
    }

    #[test]
    fn outcome_converts_both_ways() {
        let ok: Outcome = Ok(json!(1)).into();
        assert_eq!(serde_json::to_value(&ok).unwrap(), json!({"status": "ok", "result": 1}));

        let err: Outcome = Err(RelayError::transport("socket closed")).into();
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["status"], "err");
        assert_eq!(value["error"]["kind"], "TRANSPORT_ERROR");

        let back: CallResult = serde_json::from_value::<Outcome>(value).unwrap().into();
        assert_matches!(back, Err(RelayError::Transport { .. }));
    }
}
