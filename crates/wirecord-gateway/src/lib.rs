//! # wirecord-gateway
//!
//! Gateway client session for a real-time chat platform: the wire protocol,
//! handshake, heartbeat, resume and reconnect, the dispatch handlers that
//! keep the guild cache current, voice joins, and the REST collaborator.

pub mod error;
pub mod events;
mod handlers;
pub mod protocol;
pub mod rest;
pub mod session;
pub mod voice_join;

#[cfg(test)]
mod test_support;

pub use error::GatewayError;
pub use events::GatewayEventType;
pub use protocol::{CloseCode, GatewayMessage, OpCode};
pub use rest::{GatewayBot, HttpRestClient, RestClient, RestError};
pub use session::{ContinuationFn, GatewaySession, SessionIdentity, SessionPhase};
