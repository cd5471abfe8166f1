//! Gateway dispatch events
//!
//! Names of the dispatch events the session handles.

mod event_types;

pub use event_types::GatewayEventType;
