//! Close-code recovery actions

use std::fmt;

/// What a session does when its connection closes with a given code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseAction {
    /// Normal closure, nothing to recover
    Ignore,
    /// Re-dial and resume the existing session
    Resume,
    /// Drop the session identity and start over
    Reconnect,
    /// Stop for good and surface the failure
    Terminate,
}

impl CloseAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::Resume => "resume",
            Self::Reconnect => "reconnect",
            Self::Terminate => "terminate",
        }
    }
}

impl fmt::Display for CloseAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
