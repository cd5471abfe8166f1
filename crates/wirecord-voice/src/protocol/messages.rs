//! Voice signaling payloads

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use wirecord_session::Envelope;

use super::opcodes::VoiceOpCode;

/// Voice websocket envelope
///
/// The op code stays raw so an unknown op reaches the dispatch table and is
/// reported there instead of failing the whole decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceMessage {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl VoiceMessage {
    pub fn new<T: Serialize>(op: VoiceOpCode, data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            op: op.as_u8(),
            d: serde_json::to_value(data)?,
            seq: None,
        })
    }

    /// Heartbeat carrying a wall-clock nonce
    pub fn heartbeat(nonce: u64) -> Self {
        Self {
            op: VoiceOpCode::Heartbeat.as_u8(),
            d: Value::from(nonce),
            seq: None,
        }
    }

    pub fn opcode(&self) -> Option<VoiceOpCode> {
        VoiceOpCode::from_u8(self.op)
    }
}

impl Envelope for VoiceMessage {
    fn opcode(&self) -> u8 {
        self.op
    }

    fn sequence(&self) -> Option<u64> {
        self.seq
    }

    fn event_name(&self) -> Option<&str> {
        None
    }

    fn into_data(self) -> Value {
        self.d
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Milliseconds; voice servers send a float
    pub heartbeat_interval: f64,
}

impl HelloPayload {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval.max(0.0) as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyPayload {
    pub server_id: String,
    pub user_id: String,
    pub session_id: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePayload {
    pub server_id: String,
    pub session_id: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyPayload {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub modes: Vec<String>,
}

impl ReadyPayload {
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectProtocolPayload {
    pub protocol: String,
    pub data: SelectProtocolData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectProtocolData {
    pub address: String,
    pub port: u16,
    pub mode: String,
}

impl SelectProtocolPayload {
    pub fn udp(address: String, port: u16, mode: &str) -> Self {
        Self {
            protocol: "udp".to_string(),
            data: SelectProtocolData {
                address,
                port,
                mode: mode.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptionPayload {
    pub mode: String,
    pub secret_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakingPayload {
    /// Bit flags; 1 = microphone
    pub speaking: u8,
    pub delay: u32,
    pub ssrc: u32,
}

impl SpeakingPayload {
    pub fn microphone(speaking: bool, ssrc: u32) -> Self {
        Self {
            speaking: u8::from(speaking),
            delay: 0,
            ssrc,
        }
    }
}
