//! Connection state vocabulary for the feed state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of the single feed connection.
///
/// Exactly one value is held by the connection manager at any time; nothing
/// else mutates it. Observers read it through a watch channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport and none wanted (initial, or after an intentional close).
    #[default]
    Disconnected,
    /// Transport handshake in progress.
    Connecting,
    /// Transport open; frames flow.
    Connected,
    /// Unintentional close observed; a retry timer is pending.
    Reconnecting,
    /// A connect attempt failed before any transport was opened
    /// (e.g. authenticated mode with no credential).
    Error,
    /// Retry budget exhausted; no further automatic recovery.
    PermanentlyFailed,
}

impl ConnectionState {
    /// True while the manager is driving or recovering a transport.
    #[must_use]
    pub fn is_healthy(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }

    /// True for states that only an explicit `connect` can leave.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::PermanentlyFailed)
    }

    /// Wire/log representation, matching the serde encoding.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
            Self::PermanentlyFailed => "permanently_failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn healthy_states() {
        assert!(ConnectionState::Connecting.is_healthy());
        assert!(ConnectionState::Connected.is_healthy());
        assert!(ConnectionState::Reconnecting.is_healthy());
        assert!(!ConnectionState::Disconnected.is_healthy());
        assert!(!ConnectionState::Error.is_healthy());
        assert!(!ConnectionState::PermanentlyFailed.is_healthy());
    }

    #[test]
    fn terminal_states() {
        assert!(ConnectionState::Error.is_terminal());
        assert!(ConnectionState::PermanentlyFailed.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
        assert!(!ConnectionState::Disconnected.is_terminal());
    }

    #[test]
    fn display_matches_serde() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::Error,
            ConnectionState::PermanentlyFailed,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
        }
    }

    #[test]
    fn serde_snake_case() {
        let json = serde_json::to_string(&ConnectionState::PermanentlyFailed).unwrap();
        assert_eq!(json, "\"permanently_failed\"");
        let back: ConnectionState = serde_json::from_str("\"reconnecting\"").unwrap();
        assert_eq!(back, ConnectionState::Reconnecting);
    }
}
