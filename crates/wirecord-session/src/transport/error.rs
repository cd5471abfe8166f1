//! Transport errors

use std::io;

use tokio_tungstenite::tungstenite::{self, error::ProtocolError};
use wirecord_common::{Classify, ErrorClass};

/// Routing key for error handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Eof,
    UnexpectedEof,
    ConnectionReset,
    WriteLimitExceeded,
    Decode,
    Io,
    Protocol,
    Closed,
    Shutdown,
}

/// Errors raised by a transport's loops or its write path
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed by peer (EOF)")]
    Eof,

    #[error("unexpected EOF")]
    UnexpectedEof,

    #[error("connection reset")]
    ConnectionReset,

    #[error("write queue limit of {limit} exceeded")]
    WriteLimitExceeded { limit: usize },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("closed with code {code}: {reason}")]
    Closed { code: u16, reason: String },

    #[error("transport is shut down")]
    Shutdown,

    #[error("failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Eof => ErrorKind::Eof,
            Self::UnexpectedEof => ErrorKind::UnexpectedEof,
            Self::ConnectionReset => ErrorKind::ConnectionReset,
            Self::WriteLimitExceeded { .. } => ErrorKind::WriteLimitExceeded,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Io(_) | Self::Connect { .. } => ErrorKind::Io,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Closed { .. } => ErrorKind::Closed,
            Self::Shutdown => ErrorKind::Shutdown,
        }
    }

    /// Close code carried by a `Closed` error
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::Closed { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn connect(address: &str, reason: impl ToString) -> Self {
        Self::Connect {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl Classify for TransportError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Eof
            | Self::UnexpectedEof
            | Self::ConnectionReset
            | Self::Io(_)
            | Self::Connect { .. } => ErrorClass::Transport,
            Self::WriteLimitExceeded { .. } => ErrorClass::WriteLimit,
            Self::Decode(_) | Self::Protocol(_) => ErrorClass::Protocol,
            // Close codes are classified by the session that owns the table
            Self::Closed { .. } => ErrorClass::Transport,
            Self::Shutdown => ErrorClass::Terminal,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => Self::UnexpectedEof,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::ConnectionReset,
            _ => Self::Io(e.to_string()),
        }
    }
}

impl From<tungstenite::Error> for TransportError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => Self::Eof,
            tungstenite::Error::Io(io) => io.into(),
            tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                Self::ConnectionReset
            }
            other => Self::Protocol(other.to_string()),
        }
    }
}
