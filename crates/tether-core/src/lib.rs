//! # tether-core
//!
//! Foundation types shared by every Tether crate:
//!
//! - **Branded IDs**: `UserId`, `RequestId`, `ServerInstanceId`, `ConnectionId`
//! - **Errors**: [`RelayError`](errors::RelayError) taxonomy and machine-readable [`ErrorKind`](errors::ErrorKind)
//! - **Protocol**: the tagged [`Envelope`](protocol::Envelope) exchanged with agents, the
//!   caller-facing [`Command`](protocol::Command) vocabulary, and wire [`Outcome`](protocol::Outcome)s
//! - **Logging**: `tracing` subscriber bootstrap

#![deny(unsafe_code)]

pub mod constants;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod protocol;

pub use errors::{ErrorKind, RelayError};
pub use ids::{ConnectionId, RequestId, ServerInstanceId, UserId};
pub use protocol::{BrowserCommand, CallResult, Command, Envelope, Outcome, ProtocolError};
