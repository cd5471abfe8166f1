//! Gateway session errors

use wirecord_common::{Classify, ErrorClass};
use wirecord_core::{CacheError, Snowflake};
use wirecord_session::{GateError, TransportError};
use wirecord_voice::VoiceError;

use crate::rest::RestError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Rest(#[from] RestError),

    #[error(transparent)]
    Voice(#[from] VoiceError),

    #[error("invalid {op} payload: {reason}")]
    InvalidPayload { op: String, reason: String },

    #[error("no session to resume")]
    NotResumable,

    #[error("timed out waiting for {0}")]
    HandshakeTimeout(&'static str),

    #[error("resume was not confirmed in time")]
    ResumeTimeout,

    #[error("voice join for guild {0} timed out")]
    VoiceJoinTimeout(Snowflake),

    #[error("no voice session for guild {0}")]
    NoVoiceSession(Snowflake),

    #[error("gateway session cancelled")]
    Cancelled,

    #[error("gateway closed the session with terminal code {0}")]
    Terminal(u16),

    #[error("gateway session not ready: {0}")]
    NotReady(&'static str),

    #[error("heartbeat was not acknowledged")]
    Zombied,
}

impl GatewayError {
    pub(crate) fn payload(op: impl ToString, e: impl ToString) -> Self {
        Self::InvalidPayload {
            op: op.to_string(),
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

impl Classify for GatewayError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Transport(e) => e.class(),
            Self::Voice(e) => e.class(),
            Self::Cache(_)
            | Self::InvalidPayload { .. }
            | Self::NotReady(_)
            | Self::NotResumable
            | Self::NoVoiceSession(_) => ErrorClass::Protocol,
            Self::Rest(_) => ErrorClass::External,
            Self::HandshakeTimeout(_) | Self::ResumeTimeout | Self::VoiceJoinTimeout(_) => ErrorClass::HandshakeTimeout,
            Self::Zombied => ErrorClass::Transport,
            Self::Cancelled | Self::Terminal(_) => ErrorClass::Terminal,
        }
    }
}
