//! Gateway message envelope
//!
//! Every gateway payload has the format `{"op": u8, "d": any, "s": u64?, "t": string?}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use wirecord_session::Envelope;

use super::opcodes::OpCode;

/// Gateway message structure
///
/// The op code stays raw so an op this client does not know still decodes
/// and is reported by the dispatch table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayMessage {
    /// Operation code
    pub op: u8,

    /// Event data (payload)
    #[serde(default)]
    pub d: Value,

    /// Sequence number (only for Dispatch events)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,

    /// Event name (only for Dispatch events)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayMessage {
    /// Create a command message with a serializable payload
    pub fn new<T: Serialize>(op: OpCode, data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            op: op.as_u8(),
            d: serde_json::to_value(data)?,
            s: None,
            t: None,
        })
    }

    /// Create a Dispatch message (op 0)
    pub fn dispatch<T: Serialize>(event: &str, data: &T, sequence: u64) -> Result<Self, serde_json::Error> {
        Ok(Self {
            op: OpCode::Dispatch.as_u8(),
            d: serde_json::to_value(data)?,
            s: Some(sequence),
            t: Some(event.to_string()),
        })
    }

    /// Create a Heartbeat message carrying the last sequence, or null
    pub fn heartbeat(sequence: Option<u64>) -> Self {
        Self {
            op: OpCode::Heartbeat.as_u8(),
            d: sequence.map_or(Value::Null, Value::from),
            s: None,
            t: None,
        }
    }

    /// Typed op code, when known
    pub fn opcode(&self) -> Option<OpCode> {
        OpCode::from_u8(self.op)
    }

    /// Check if this is a dispatch event
    pub fn is_dispatch(&self) -> bool {
        self.op == OpCode::Dispatch.as_u8()
    }

    /// Get the event name if this is a dispatch event
    pub fn event_name(&self) -> Option<&str> {
        self.t.as_deref()
    }
}

impl Envelope for GatewayMessage {
    fn opcode(&self) -> u8 {
        self.op
    }

    fn sequence(&self) -> Option<u64> {
        self.s
    }

    fn event_name(&self) -> Option<&str> {
        // Only dispatches route by name; a stray `t` on a control op is ignored
        if self.is_dispatch() {
            self.t.as_deref()
        } else {
            None
        }
    }

    fn into_data(self) -> Value {
        self.d
    }
}
