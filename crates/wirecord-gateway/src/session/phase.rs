//! Gateway session phases

use std::fmt;

/// State-machine phase of a gateway session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionPhase {
    #[default]
    Disconnected,
    Connecting,
    AwaitingHello,
    Identifying,
    AwaitingReady,
    Active,
    Resuming,
    Reconnecting,
}

impl SessionPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingHello => "awaiting_hello",
            Self::Identifying => "identifying",
            Self::AwaitingReady => "awaiting_ready",
            Self::Active => "active",
            Self::Resuming => "resuming",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
