//! Session state machine.
//!
//! ```text
//!                NonceAccepted              KeepAlive
//! Unregistered ───────────────▶ Registered ◀─────────┐
//!      │                           │   └─────────────┘
//!      │ NonceRejected             │ Unregister
//!      │ Unregister                │ Shutdown
//!      │ Shutdown                  │ Expired
//!      │ Expired                   ▼
//!      └─────────────────────▶  Closed  (terminal)
//! ```
//!
//! Every edge not drawn above is rejected with
//! [`RelayError::InvalidTransition`](crate::RelayError::InvalidTransition).

use std::fmt;

/// Lifecycle state of a unit's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created on first contact; handshake not completed.
    Unregistered,
    /// Nonce validated; the session is live.
    Registered,
    /// Removed from the registry. Never reused.
    Closed,
}

/// Something that happened to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    /// The peer presented the expected nonce.
    NonceAccepted,
    /// The peer presented a wrong nonce.
    NonceRejected,
    /// An already-registered unit registered again.
    KeepAlive,
    /// The unit was explicitly unregistered.
    Unregister,
    /// The registry is shutting down.
    Shutdown,
    /// The session outlived the configured liveness timeout.
    Expired,
}

impl SessionState {
    /// Target state for `event`, or `None` when the edge does not exist.
    pub fn next(self, event: SessionEvent) -> Option<SessionState> {
        use SessionEvent::*;
        use SessionState::*;

        match (self, event) {
            (Unregistered, NonceAccepted) => Some(Registered),
            (Unregistered, NonceRejected | Unregister | Shutdown | Expired) => Some(Closed),
            (Registered, KeepAlive) => Some(Registered),
            (Registered, Unregister | Shutdown | Expired) => Some(Closed),
            (Registered, NonceAccepted | NonceRejected) => None,
            (Unregistered, KeepAlive) => None,
            (Closed, _) => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unregistered => write!(f, "UNREGISTERED"),
            Self::Registered => write!(f, "REGISTERED"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NonceAccepted => "nonce-accepted",
            Self::NonceRejected => "nonce-rejected",
            Self::KeepAlive => "keep-alive",
            Self::Unregister => "unregister",
            Self::Shutdown => "shutdown",
            Self::Expired => "expired",
        };
        f.write_str(name)
    }
}
