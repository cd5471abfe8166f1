//! Error classes
//!
//! Every session-layer error maps onto one of these classes, which decide
//! whether the session escalates (resume, reconnect) or carries on.

use std::fmt;

/// Recovery class of a session error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Connection reset or EOF; resume, then reconnect
    Transport,
    /// Malformed or unexpected payload; drop the single event
    Protocol,
    /// Outbound queue full; drop the single write
    WriteLimit,
    /// Resume confirmation or voice connect timed out; escalate to reconnect
    HandshakeTimeout,
    /// Server rejected the session for good; exit without retry
    Terminal,
    /// REST or audio collaborator failure; logged, operation aborted
    External,
}

impl ErrorClass {
    /// Whether the session should try to re-establish itself
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transport | Self::HandshakeTimeout)
    }

    /// Whether the session can keep running as-is
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Protocol | Self::WriteLimit | Self::External)
    }

    /// Whether the session must stop
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal)
    }

    /// Short label for log fields
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::WriteLimit => "write_limit",
            Self::HandshakeTimeout => "handshake_timeout",
            Self::Terminal => "terminal",
            Self::External => "external",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that know their recovery class
pub trait Classify {
    fn class(&self) -> ErrorClass;

    fn is_recoverable(&self) -> bool {
        self.class().is_recoverable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classes() {
        assert!(ErrorClass::Transport.is_recoverable());
        assert!(ErrorClass::HandshakeTimeout.is_recoverable());
        assert!(!ErrorClass::Protocol.is_recoverable());
        assert!(!ErrorClass::Terminal.is_recoverable());
    }

    #[test]
    fn test_classes_partition() {
        let all = [
            ErrorClass::Transport,
            ErrorClass::Protocol,
            ErrorClass::WriteLimit,
            ErrorClass::HandshakeTimeout,
            ErrorClass::Terminal,
            ErrorClass::External,
        ];
        for class in all {
            let buckets = [class.is_recoverable(), class.is_transient(), class.is_terminal()];
            assert_eq!(buckets.iter().filter(|b| **b).count(), 1, "{class}");
        }
    }

    #[test]
    fn test_classify_default_method() {
        struct Reset;
        impl Classify for Reset {
            fn class(&self) -> ErrorClass {
                ErrorClass::Transport
            }
        }
        assert!(Reset.is_recoverable());
    }
}
