//! Voice websocket close codes

use wirecord_session::CloseAction;

/// Close codes sent by the voice server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum VoiceCloseCode {
    /// Normal closure
    Normal = 1000,
    /// Connection dropped without a close frame
    Abnormal = 1006,
    /// Invalid opcode sent
    UnknownOpcode = 4001,
    /// Invalid payload sent
    FailedToDecode = 4002,
    /// Sent payload before Identify
    NotAuthenticated = 4003,
    /// Incorrect token in Identify
    AuthenticationFailed = 4004,
    /// Sent Identify twice
    AlreadyAuthenticated = 4005,
    /// Session is no longer valid
    SessionNoLongerValid = 4006,
    /// Session has timed out
    SessionTimeout = 4009,
    /// Voice server could not be found
    ServerNotFound = 4011,
    /// Unrecognized media protocol
    UnknownProtocol = 4012,
    /// Kicked, or the channel was deleted
    Disconnected = 4014,
    /// Voice server crashed; safe to resume
    VoiceServerCrashed = 4015,
    /// Unrecognized encryption mode
    UnknownEncryptionMode = 4016,
    /// Malformed request
    BadRequest = 4020,
    /// Rate limited
    RateLimited = 4021,
    /// Call terminated by the server
    CallTerminated = 4022,
}

impl VoiceCloseCode {
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1000 => Some(Self::Normal),
            1006 => Some(Self::Abnormal),
            4001 => Some(Self::UnknownOpcode),
            4002 => Some(Self::FailedToDecode),
            4003 => Some(Self::NotAuthenticated),
            4004 => Some(Self::AuthenticationFailed),
            4005 => Some(Self::AlreadyAuthenticated),
            4006 => Some(Self::SessionNoLongerValid),
            4009 => Some(Self::SessionTimeout),
            4011 => Some(Self::ServerNotFound),
            4012 => Some(Self::UnknownProtocol),
            4014 => Some(Self::Disconnected),
            4015 => Some(Self::VoiceServerCrashed),
            4016 => Some(Self::UnknownEncryptionMode),
            4020 => Some(Self::BadRequest),
            4021 => Some(Self::RateLimited),
            4022 => Some(Self::CallTerminated),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Recovery action for this code
    #[must_use]
    pub const fn action(self) -> CloseAction {
        match self {
            Self::Normal => CloseAction::Ignore,
            Self::Abnormal | Self::SessionTimeout | Self::VoiceServerCrashed => CloseAction::Resume,
            _ => CloseAction::Terminate,
        }
    }

    /// Every code with the given recovery action
    pub fn with_action(action: CloseAction) -> Vec<u16> {
        Self::ALL
            .iter()
            .filter(|code| code.action() == action)
            .map(|code| code.as_u16())
            .collect()
    }

    const ALL: [Self; 17] = [
        Self::Normal,
        Self::Abnormal,
        Self::UnknownOpcode,
        Self::FailedToDecode,
        Self::NotAuthenticated,
        Self::AuthenticationFailed,
        Self::AlreadyAuthenticated,
        Self::SessionNoLongerValid,
        Self::SessionTimeout,
        Self::ServerNotFound,
        Self::UnknownProtocol,
        Self::Disconnected,
        Self::VoiceServerCrashed,
        Self::UnknownEncryptionMode,
        Self::BadRequest,
        Self::RateLimited,
        Self::CallTerminated,
    ];
}

impl std::fmt::Display for VoiceCloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.as_u16())
    }
}
