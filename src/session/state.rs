use std::fmt;

/// Lifecycle of a [`Session`](super::Session).
///
/// ```text
/// Inactive -> Initializing -> Running (host)
///                          -> Connecting (joiner) -> Resetting -> Running
/// Running <-> Resetting
/// Connecting | Resetting | Running -> ClosingSession -> Inactive
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// No session.
    #[default]
    Inactive,
    /// Local setup (settings, transport) in progress.
    Initializing,
    /// A joiner waiting for the host to accept it.
    Connecting,
    /// Every player is reloading the host's snapshot and (re)connecting to the others.
    Resetting,
    /// Frames are being simulated.
    Running,
    /// Waiting for peers to disconnect before going inactive.
    ClosingSession,
}

impl SessionState {
    /// Whether a session exists that is not on its way out.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Initializing | Self::Connecting | Self::Resetting | Self::Running
        )
    }

    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use SessionState::{ClosingSession, Connecting, Inactive, Initializing, Resetting, Running};
        matches!(
            (self, next),
            (Inactive, Initializing)
                | (Initializing, Running | Connecting | Inactive)
                | (Connecting, Resetting | ClosingSession)
                | (Resetting, Running | Resetting | ClosingSession)
                | (Running, Resetting | ClosingSession)
                | (ClosingSession, Inactive)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Inactive => "inactive",
            Self::Initializing => "initializing",
            Self::Connecting => "connecting",
            Self::Resetting => "resetting",
            Self::Running => "running",
            Self::ClosingSession => "closing",
        })
    }
}

/// Which side of the session this peer is on.
///
/// The host owns membership: it assigns player ids, decides when to reset and broadcasts the
/// authoritative state. It is always player 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Player 0, the authority.
    Host,
    /// Any other player.
    Client,
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    const ALL: [SessionState; 6] = [
        SessionState::Inactive,
        SessionState::Initializing,
        SessionState::Connecting,
        SessionState::Resetting,
        SessionState::Running,
        SessionState::ClosingSession,
    ];

    #[test]
    fn legal_transitions_are_exactly_the_documented_set() {
        let legal = [
            (SessionState::Inactive, SessionState::Initializing),
            (SessionState::Initializing, SessionState::Running),
            (SessionState::Initializing, SessionState::Connecting),
            (SessionState::Initializing, SessionState::Inactive),
            (SessionState::Connecting, SessionState::Resetting),
            (SessionState::Connecting, SessionState::ClosingSession),
            (SessionState::Resetting, SessionState::Running),
            (SessionState::Resetting, SessionState::Resetting),
            (SessionState::Resetting, SessionState::ClosingSession),
            (SessionState::Running, SessionState::Resetting),
            (SessionState::Running, SessionState::ClosingSession),
            (SessionState::ClosingSession, SessionState::Inactive),
        ];
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn closing_and_inactive_are_not_active() {
        assert!(!SessionState::Inactive.is_active());
        assert!(!SessionState::ClosingSession.is_active());
        assert!(SessionState::Initializing.is_active());
        assert!(SessionState::Running.is_active());
    }
}
