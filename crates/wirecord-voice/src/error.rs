//! Voice errors

use wirecord_common::{Classify, ErrorClass};
use wirecord_session::{GateError, TransportError};

use crate::crypto::CryptoError;

#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("voice connect timed out")]
    ConnectTimeout,

    #[error("voice resume was not confirmed in time")]
    ResumeTimeout,

    #[error("IP discovery timed out")]
    DiscoveryTimeout,

    #[error("voice session cancelled")]
    Cancelled,

    #[error("invalid {op} payload: {reason}")]
    InvalidPayload { op: &'static str, reason: String },

    #[error("no supported encryption mode offered: {0:?}")]
    NoSupportedMode(Vec<String>),

    #[error("voice session closed with terminal code {0}")]
    Terminal(u16),

    #[error("voice session not ready: {0}")]
    NotReady(&'static str),

    #[error("audio is already playing")]
    AlreadyPlaying,

    #[error("audio source failed: {0}")]
    Source(String),

    #[error("voice heartbeat was not acknowledged")]
    Zombied,
}

impl VoiceError {
    pub(crate) fn payload(op: &'static str, e: impl ToString) -> Self {
        Self::InvalidPayload {
            op,
            reason: e.to_string(),
        }
    }

    /// Map a readiness gate failure onto a timeout error
    pub(crate) fn from_gate(e: GateError, timeout: Self) -> Self {
        match e {
            GateError::Timeout => timeout,
            GateError::Cancelled => Self::Cancelled,
        }
    }
}

impl Classify for VoiceError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Transport(e) => e.class(),
            Self::Crypto(_) | Self::InvalidPayload { .. } | Self::NoSupportedMode(_) => ErrorClass::Protocol,
            Self::ConnectTimeout | Self::ResumeTimeout | Self::DiscoveryTimeout => ErrorClass::HandshakeTimeout,
            Self::Zombied => ErrorClass::Transport,
            Self::Terminal(_) | Self::Cancelled => ErrorClass::Terminal,
            Self::NotReady(_) | Self::AlreadyPlaying => ErrorClass::Protocol,
            Self::Source(_) => ErrorClass::External,
        }
    }
}
