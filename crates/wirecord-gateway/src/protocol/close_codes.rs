//! Gateway close codes
//!
//! Each code maps to the recovery action the client takes when the server
//! closes the connection with it.

use wirecord_session::CloseAction;

/// Gateway WebSocket close codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    /// Normal closure
    Normal = 1000,
    /// Unknown error occurred
    UnknownError = 4000,
    /// Invalid opcode sent
    UnknownOpcode = 4001,
    /// Invalid payload encoding
    DecodeError = 4002,
    /// Sent payload before Identify
    NotAuthenticated = 4003,
    /// Invalid token provided
    AuthenticationFailed = 4004,
    /// Sent Identify twice
    AlreadyAuthenticated = 4005,
    /// Invalid sequence number for Resume
    InvalidSequence = 4007,
    /// Too many requests
    RateLimited = 4008,
    /// Session has timed out
    SessionTimedOut = 4009,
    /// Invalid shard configuration
    InvalidShard = 4010,
    /// Sharding is required
    ShardingRequired = 4011,
    /// Invalid/outdated API version
    InvalidApiVersion = 4012,
    /// Invalid intents bits
    InvalidIntents = 4013,
    /// Privileged intents not enabled
    DisallowedIntents = 4014,
}

impl CloseCode {
    const ALL: [Self; 15] = [
        Self::Normal,
        Self::UnknownError,
        Self::UnknownOpcode,
        Self::DecodeError,
        Self::NotAuthenticated,
        Self::AuthenticationFailed,
        Self::AlreadyAuthenticated,
        Self::InvalidSequence,
        Self::RateLimited,
        Self::SessionTimedOut,
        Self::InvalidShard,
        Self::ShardingRequired,
        Self::InvalidApiVersion,
        Self::InvalidIntents,
        Self::DisallowedIntents,
    ];

    /// Create a `CloseCode` from a raw u16 value
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.as_u16() == value)
    }

    /// Get the raw u16 value
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Recovery action for this code
    #[must_use]
    pub const fn action(self) -> CloseAction {
        match self {
            Self::Normal => CloseAction::Ignore,
            Self::UnknownError
            | Self::UnknownOpcode
            | Self::DecodeError
            | Self::NotAuthenticated
            | Self::AlreadyAuthenticated
            | Self::RateLimited => CloseAction::Resume,
            Self::InvalidSequence | Self::SessionTimedOut => CloseAction::Reconnect,
            Self::AuthenticationFailed
            | Self::InvalidShard
            | Self::ShardingRequired
            | Self::InvalidApiVersion
            | Self::InvalidIntents
            | Self::DisallowedIntents => CloseAction::Terminate,
        }
    }

    /// Every code with the given recovery action
    pub fn with_action(action: CloseAction) -> Vec<u16> {
        Self::ALL
            .into_iter()
            .filter(|code| code.action() == action)
            .map(Self::as_u16)
            .collect()
    }

    /// Get the description for this close code
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Normal => "Normal closure",
            Self::UnknownError => "Unknown error occurred",
            Self::UnknownOpcode => "Invalid opcode sent",
            Self::DecodeError => "Invalid payload encoding",
            Self::NotAuthenticated => "Not authenticated",
            Self::AuthenticationFailed => "Authentication failed",
            Self::AlreadyAuthenticated => "Already authenticated",
            Self::InvalidSequence => "Invalid sequence number",
            Self::RateLimited => "Rate limited",
            Self::SessionTimedOut => "Session timed out",
            Self::InvalidShard => "Invalid shard configuration",
            Self::ShardingRequired => "Sharding required",
            Self::InvalidApiVersion => "Invalid API version",
            Self::InvalidIntents => "Invalid intents",
            Self::DisallowedIntents => "Disallowed intents",
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({}): {}", self, self.as_u16(), self.description())
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.as_u16()
    }
}
