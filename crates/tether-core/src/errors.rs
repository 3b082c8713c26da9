//! Error taxonomy for the relay.
//!
//! Every failure a caller of the dispatcher can observe is a [`RelayError`].
//! Errors are serialisable because an outcome produced on the process that
//! owns the agent socket may have to travel back to the process where the
//! caller is waiting.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{RequestId, UserId};

// ─────────────────────────────────────────────────────────────────────────────
// Error kinds
// ─────────────────────────────────────────────────────────────────────────────

/// Machine-readable error code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// No live agent session for the user.
    NotConnected,
    /// Deadline elapsed before a response arrived.
    Timeout,
    /// The agent executed the command and reported failure.
    ToolError,
    /// Caller input failed shape validation.
    MalformedRequest,
    /// Socket or cross-process delivery failed before any response.
    TransportError,
    /// A late resolve/reject after the request already settled.
    DuplicateSuppressed,
    /// Caller or agent credentials were rejected.
    Unauthorized,
    /// Unexpected internal failure (shared-state backend, serialization).
    InternalError,
}

impl ErrorKind {
    /// Wire string for this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotConnected => "NOT_CONNECTED",
            Self::Timeout => "TIMEOUT",
            Self::ToolError => "TOOL_ERROR",
            Self::MalformedRequest => "MALFORMED_REQUEST",
            Self::TransportError => "TRANSPORT_ERROR",
            Self::DuplicateSuppressed => "DUPLICATE_SUPPRESSED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RelayError
// ─────────────────────────────────────────────────────────────────────────────

/// Error returned by the dispatcher and the relay's shared-state layers.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all_fields = "camelCase")]
pub enum RelayError {
    /// No live agent session for the user.
    #[serde(rename = "NOT_CONNECTED")]
    #[error("agent not connected for user {user_id}")]
    NotConnected {
        /// User whose agent is unreachable.
        user_id: UserId,
    },

    /// Deadline elapsed before a response arrived.
    #[serde(rename = "TIMEOUT")]
    #[error("request {request_id} timed out after {timeout_ms}ms")]
    Timeout {
        /// The expired request.
        request_id: RequestId,
        /// The deadline that applied, in milliseconds.
        timeout_ms: u64,
    },

    /// The agent reported failure. Carries the agent's own message.
    #[serde(rename = "TOOL_ERROR")]
    #[error("{message}")]
    ToolError {
        /// Agent-supplied error message.
        message: String,
    },

    /// Caller input failed shape validation.
    #[serde(rename = "MALFORMED_REQUEST")]
    #[error("malformed request: {message}")]
    MalformedRequest {
        /// What is wrong with the input.
        message: String,
    },

    /// Socket-level or cross-process delivery failure.
    #[serde(rename = "TRANSPORT_ERROR")]
    #[error("transport error: {message}")]
    Transport {
        /// Description of the failure.
        message: String,
    },

    /// Internal only: a settlement arrived after the request already settled.
    #[serde(rename = "DUPLICATE_SUPPRESSED")]
    #[error("duplicate settlement suppressed for request {request_id}")]
    DuplicateSuppressed {
        /// The already-settled request.
        request_id: RequestId,
    },

    /// Caller or agent credentials were rejected.
    #[serde(rename = "UNAUTHORIZED")]
    #[error("unauthorized: {message}")]
    Unauthorized {
        /// Reason for rejection.
        message: String,
    },

    /// Unexpected internal failure.
    #[serde(rename = "INTERNAL_ERROR")]
    #[error("internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

impl RelayError {
    /// Agent not connected.
    #[must_use]
    pub fn not_connected(user_id: &UserId) -> Self {
        Self::NotConnected {
            user_id: user_id.clone(),
        }
    }

    /// Agent-reported failure.
    #[must_use]
    pub fn tool(message: impl Into<String>) -> Self {
        Self::ToolError {
            message: message.into(),
        }
    }

    /// Caller input failed validation.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedRequest {
            message: message.into(),
        }
    }

    /// Delivery failure.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Rejected credentials.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Internal failure.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Machine-readable kind.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotConnected { .. } => ErrorKind::NotConnected,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ToolError { .. } => ErrorKind::ToolError,
            Self::MalformedRequest { .. } => ErrorKind::MalformedRequest,
            Self::Transport { .. } => ErrorKind::TransportError,
            Self::DuplicateSuppressed { .. } => ErrorKind::DuplicateSuppressed,
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
            Self::Internal { .. } => ErrorKind::InternalError,
        }
    }

    /// Whether this error may be shown to an HTTP caller.
    ///
    /// `DuplicateSuppressed` is bookkeeping and never leaves the relay.
    #[must_use]
    pub fn is_caller_visible(&self) -> bool {
        !matches!(self, Self::DuplicateSuppressed { .. })
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("serialization failed: {err}"))
    }
}
