//! # tether-relay
//!
//! The relay proper: everything between "a caller wants user X's agent to do
//! something" and "the caller has exactly one answer".
//!
//! - **Sessions**: [`AgentSession`] wraps one live agent socket; [`SessionTable`]
//!   is the process-local map of them, exclusively owned by this process
//! - **Registry**: [`AgentRegistry`] answers "which process holds user X's
//!   socket" for every process, with compare-and-delete unregistration
//! - **Correlator**: [`Correlator`] matches replies to waiting callers by request
//!   id with first-settlement-wins semantics and enforced deadlines
//! - **Bus**: [`RelayBus`] carries forwarded commands and their replies between
//!   processes, addressed by [`ServerInstanceId`](tether_core::ServerInstanceId)
//! - **Relay**: [`Relay`] wires the above together; [`Relay::call`] is the
//!   dispatcher entry point
//!
//! With the `redis` feature, [`redis`](crate::redis) provides a registry and bus
//! shared through Redis.

#![deny(unsafe_code)]

pub mod bus;
pub mod correlator;
pub mod credentials;
pub mod dispatcher;
pub mod metrics;
pub mod registry;
pub mod relay;
pub mod session;
pub mod sessions;

#[cfg(feature = "redis")]
pub mod redis;

pub use bus::{BusMessage, MemoryBus, RelayBus};
pub use correlator::{Correlator, PendingCall, Settled};
pub use credentials::{AgentCredential, CredentialStore, StaticCredentialStore};
pub use registry::{AgentRegistry, MemoryRegistry};
pub use relay::{Relay, RelayConfig};
pub use session::AgentSession;
pub use sessions::SessionTable;
