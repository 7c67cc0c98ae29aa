//! Error types for the relay control plane.

use std::fmt;

use crate::session::{SessionEvent, SessionState};
use crate::transport::ChannelRole;

/// Errors that can occur in the relay control plane.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Wire**: [`Parse`](Self::Parse): malformed registration datagrams.
/// - **Transport**: [`Io`](Self::Io), [`ChannelNotOpen`](Self::ChannelNotOpen).
/// - **Session**: [`SessionNotFound`](Self::SessionNotFound),
///   [`SessionExists`](Self::SessionExists),
///   [`SessionClosed`](Self::SessionClosed),
///   [`InvalidTransition`](Self::InvalidTransition).
/// - **Ports**: [`PortPoolExhausted`](Self::PortPoolExhausted),
///   [`InvalidPort`](Self::InvalidPort), [`PortInUse`](Self::PortInUse).
/// - **Server**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning).
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to decode a registration datagram.
    #[error("registration parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// No session is registered under the given unit id.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// A session for this unit id already exists in the registry.
    #[error("session already exists: {0}")]
    SessionExists(String),

    /// The session was closed and can no longer be mutated.
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// The state machine has no edge for this event from the current state.
    #[error("invalid session transition: {event} from {from}")]
    InvalidTransition {
        from: SessionState,
        event: SessionEvent,
    },

    /// The [`PortPool`](crate::resource::PortPool) has no free ports left.
    #[error("port pool exhausted")]
    PortPoolExhausted,

    /// Port 0 cannot be used as a client port.
    #[error("invalid port: {0}")]
    InvalidPort(u16),

    /// The port is already held by another owner.
    #[error("port {port} already held by {owner}")]
    PortInUse { port: u16, owner: String },

    /// No endpoint is open for this owner and role.
    #[error("no {role} channel open for {owner}")]
    ChannelNotOpen { owner: String, role: ChannelRole },

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,
}

/// Specific kind of registration datagram decode failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// The datagram carried no bytes.
    EmptyDatagram,
    /// The datagram ended before a field was complete.
    Truncated,
    /// The leading cookie did not match the configured magic cookie.
    BadMagicCookie(u32),
    /// The message type byte is not a known message.
    UnknownMessageType(u8),
    /// The status byte of a response is neither SUCCESS nor NOT_ACCEPTED.
    UnknownStatus(u8),
    /// A length-prefixed string was not valid UTF-8.
    InvalidUtf8,
    /// A request carried an empty unit id.
    EmptyUnitId,
    /// Bytes remained after the last field.
    TrailingBytes(usize),
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyDatagram => write!(f, "empty datagram"),
            Self::Truncated => write!(f, "truncated message"),
            Self::BadMagicCookie(cookie) => write!(f, "bad magic cookie {cookie:#010x}"),
            Self::UnknownMessageType(t) => write!(f, "unknown message type {t}"),
            Self::UnknownStatus(s) => write!(f, "unknown status code {s}"),
            Self::InvalidUtf8 => write!(f, "string field is not valid UTF-8"),
            Self::EmptyUnitId => write!(f, "empty unit id"),
            Self::TrailingBytes(n) => write!(f, "{n} trailing bytes"),
        }
    }
}

impl From<ParseErrorKind> for RelayError {
    fn from(kind: ParseErrorKind) -> Self {
        RelayError::Parse { kind }
    }
}

/// Convenience alias for `Result<T, RelayError>`.
pub type Result<T> = std::result::Result<T, RelayError>;
