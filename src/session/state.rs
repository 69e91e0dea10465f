//! Session state and state observers.

use std::fmt;

use crate::listener::Observer;

/// Connection state of a session.
///
/// ```text
/// Connecting ─► Connected ─► Recovering ─► Connected
///                  │              │
///                  └─► Closed ◄───┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Connected,
    Recovering,
    Closed,
}

impl SessionState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connecting, Closed)
                | (Connected, Recovering)
                | (Connected, Closed)
                | (Recovering, Connected)
                | (Recovering, Closed)
        )
    }

    /// Closed is terminal.
    #[inline]
    pub fn is_closed(self) -> bool {
        self == SessionState::Closed
    }

    /// Connected or Recovering: the session accepts new work.
    #[inline]
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Recovering)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "CONNECTING",
            SessionState::Connected => "CONNECTED",
            SessionState::Recovering => "RECOVERING",
            SessionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// A state change, as seen by a [`SessionListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub old: SessionState,
    pub new: SessionState,
}

/// Observes every state change of a session.
pub trait SessionListener: Observer<StateChange> {}

impl<T: Observer<StateChange>> SessionListener for T {}
