//! Connection lifecycle states.
//!
//! A connection moves through `Closed -> Connecting -> Open -> Closed` and
//! through no other transition. The state is `Open` exactly when the
//! connection holds a session.

use std::fmt;

/// The observable state of a [`Connection`](crate::Connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No session is held.
    #[default]
    Closed,
    /// A fresh session is being opened.
    Connecting,
    /// A session is held and usable.
    Open,
}

impl ConnectionState {
    /// Whether the state is [`ConnectionState::Open`].
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }

    /// Whether the state is [`ConnectionState::Closed`].
    #[must_use]
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Lower-case name used in log fields.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Open => "open",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_closed() {
        assert_eq!(ConnectionState::default(), ConnectionState::Closed);
        assert!(ConnectionState::default().is_closed());
    }

    #[test]
    fn test_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert!(ConnectionState::Open.is_open());
        assert!(!ConnectionState::Connecting.is_open());
    }
}
