//! Tunnel lifecycle states and the legal transitions between them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a single tunnel connection.
///
/// `Closed` and `Failed` are terminal for an identifier: any later attempt on
/// the same config gets a fresh identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TunnelState {
    Pending,
    Connecting,
    Connected,
    Degraded,
    Reconnecting,
    Failed,
    Closed,
}

impl TunnelState {
    pub const ALL: [Self; 7] = [
        Self::Pending,
        Self::Connecting,
        Self::Connected,
        Self::Degraded,
        Self::Reconnecting,
        Self::Failed,
        Self::Closed,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Degraded => "DEGRADED",
            Self::Reconnecting => "RECONNECTING",
            Self::Failed => "FAILED",
            Self::Closed => "CLOSED",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    /// Whether the forwarded port is expected to carry traffic.
    pub const fn is_serving(self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }

    /// Whether `self -> next` is a legal lifecycle step.
    ///
    /// `Connected` never jumps straight to `Reconnecting`; a failing tunnel
    /// always passes through `Degraded` first.
    pub const fn can_transition_to(self, next: Self) -> bool {
        use TunnelState::{Closed, Connected, Connecting, Degraded, Failed, Pending, Reconnecting};
        matches!(
            (self, next),
            (Pending, Connecting | Failed | Closed)
                | (Connecting, Connected | Reconnecting | Failed | Closed)
                | (Connected, Degraded | Closed)
                | (Degraded, Connected | Reconnecting | Closed)
                | (Reconnecting, Connecting | Failed | Closed)
                | (Failed, Closed)
        )
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_legal() {
        assert!(TunnelState::Pending.can_transition_to(TunnelState::Connecting));
        assert!(TunnelState::Connecting.can_transition_to(TunnelState::Connected));
        assert!(TunnelState::Connected.can_transition_to(TunnelState::Degraded));
        assert!(TunnelState::Degraded.can_transition_to(TunnelState::Connected));
        assert!(TunnelState::Degraded.can_transition_to(TunnelState::Reconnecting));
        assert!(TunnelState::Reconnecting.can_transition_to(TunnelState::Connecting));
        assert!(TunnelState::Reconnecting.can_transition_to(TunnelState::Failed));
    }

    #[test]
    fn connected_cannot_skip_degraded() {
        assert!(!TunnelState::Connected.can_transition_to(TunnelState::Reconnecting));
    }

    #[test]
    fn every_non_closed_state_can_close() {
        for state in TunnelState::ALL {
            if state != TunnelState::Closed {
                assert!(state.can_transition_to(TunnelState::Closed), "{state}");
            }
        }
    }

    #[test]
    fn terminal_states_have_no_way_back() {
        for next in TunnelState::ALL {
            assert!(!TunnelState::Closed.can_transition_to(next));
            if next != TunnelState::Closed {
                assert!(!TunnelState::Failed.can_transition_to(next));
            }
        }
    }

    #[test]
    fn serializes_in_screaming_case() {
        let json = serde_json::to_string(&TunnelState::Reconnecting).unwrap_or_default();
        assert_eq!(json, "\"RECONNECTING\"");
    }
}
