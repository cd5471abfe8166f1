//! Integration test utilities for the gateway client
//!
//! Provides scripted gateway and voice servers on loopback sockets, a
//! recording REST client, and payload builders.

pub mod fixtures;
pub mod helpers;

pub use fixtures::*;
pub use helpers::*;
