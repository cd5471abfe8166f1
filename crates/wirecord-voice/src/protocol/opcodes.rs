//! Voice operation codes

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Voice websocket op codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VoiceOpCode {
    /// Begin a voice session (client only)
    Identify = 0,
    /// Select the media protocol and report the discovered address (client only)
    SelectProtocol = 1,
    /// SSRC, media address and supported encryption modes (server only)
    Ready = 2,
    /// Keep the connection alive; carries a nonce (client only)
    Heartbeat = 3,
    /// Negotiated encryption mode and secret key (server only)
    SessionDescription = 4,
    /// Speaking state (client/server)
    Speaking = 5,
    /// Heartbeat acknowledged (server only)
    HeartbeatAck = 6,
    /// Resume a dropped connection (client only)
    Resume = 7,
    /// Sent on connect with the heartbeat interval (server only)
    Hello = 8,
    /// Resume acknowledged (server only)
    Resumed = 9,
    /// Another client left the call (server only)
    ClientDisconnect = 13,
}

impl VoiceOpCode {
    /// Create a `VoiceOpCode` from a raw integer value
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Identify),
            1 => Some(Self::SelectProtocol),
            2 => Some(Self::Ready),
            3 => Some(Self::Heartbeat),
            4 => Some(Self::SessionDescription),
            5 => Some(Self::Speaking),
            6 => Some(Self::HeartbeatAck),
            7 => Some(Self::Resume),
            8 => Some(Self::Hello),
            9 => Some(Self::Resumed),
            13 => Some(Self::ClientDisconnect),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Check if this op code can be sent by the client
    #[must_use]
    pub const fn is_client_op(self) -> bool {
        matches!(
            self,
            Self::Identify | Self::SelectProtocol | Self::Heartbeat | Self::Speaking | Self::Resume
        )
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Identify => "Identify",
            Self::SelectProtocol => "SelectProtocol",
            Self::Ready => "Ready",
            Self::Heartbeat => "Heartbeat",
            Self::SessionDescription => "SessionDescription",
            Self::Speaking => "Speaking",
            Self::HeartbeatAck => "HeartbeatAck",
            Self::Resume => "Resume",
            Self::Hello => "Hello",
            Self::Resumed => "Resumed",
            Self::ClientDisconnect => "ClientDisconnect",
        }
    }
}

impl Serialize for VoiceOpCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for VoiceOpCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u8::deserialize(deserializer)?;
        Self::from_u8(value).ok_or_else(|| serde::de::Error::custom(format!("invalid voice op code: {value}")))
    }
}

impl std::fmt::Display for VoiceOpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_u8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_from_u8() {
        assert_eq!(VoiceOpCode::from_u8(0), Some(VoiceOpCode::Identify));
        assert_eq!(VoiceOpCode::from_u8(2), Some(VoiceOpCode::Ready));
        assert_eq!(VoiceOpCode::from_u8(4), Some(VoiceOpCode::SessionDescription));
        assert_eq!(VoiceOpCode::from_u8(8), Some(VoiceOpCode::Hello));
        assert_eq!(VoiceOpCode::from_u8(9), Some(VoiceOpCode::Resumed));
        assert_eq!(VoiceOpCode::from_u8(13), Some(VoiceOpCode::ClientDisconnect));
        assert_eq!(VoiceOpCode::from_u8(10), None);
        assert_eq!(VoiceOpCode::from_u8(255), None);
    }

    #[test]
    fn test_client_ops() {
        assert!(VoiceOpCode::Identify.is_client_op());
        assert!(VoiceOpCode::Heartbeat.is_client_op());
        assert!(VoiceOpCode::Speaking.is_client_op());
        assert!(!VoiceOpCode::Hello.is_client_op());
        assert!(!VoiceOpCode::SessionDescription.is_client_op());
    }

    #[test]
    fn test_opcode_serialization() {
        assert_eq!(serde_json::to_string(&VoiceOpCode::Hello).unwrap(), "8");
        let op: VoiceOpCode = serde_json::from_str("1").unwrap();
        assert_eq!(op, VoiceOpCode::SelectProtocol);
        assert!(serde_json::from_str::<VoiceOpCode>("42").is_err());
    }

    #[test]
    fn test_opcode_display() {
        assert_eq!(VoiceOpCode::Ready.to_string(), "Ready (2)");
    }
}
