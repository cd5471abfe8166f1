//! # wirecord-session
//!
//! Duplex session building blocks shared by the gateway and voice clients:
//! the transport with its read/listen/write/error loops, one-shot readiness
//! gates, the heartbeat timer, and the opcode/event dispatch table.

pub mod close;
pub mod codec;
pub mod dispatch;
pub mod gate;
pub mod heartbeat;
pub mod transport;

pub use close::CloseAction;
pub use codec::{Codec, DecodeError, JsonCodec};
pub use dispatch::{DispatchError, DispatchTable, Envelope, SessionContext};
pub use gate::{Gate, GateError, GateSet};
pub use heartbeat::{HeartbeatSlot, HeartbeatTracker};
pub use transport::{ErrorKind, Frame, Outbox, Transport, TransportBuilder, TransportError};
