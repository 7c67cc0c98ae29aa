//! Channel provider seam between the control plane and the network.
//!
//! The control plane never binds sockets itself. It asks a
//! [`ChannelProvider`] to open an endpoint for an owner and role, to close it
//! again, and to send datagrams from it:
//!
//! - **Register**: the relay-wide endpoint that receives registration
//!   requests and sends responses.
//! - **Control**: per-session RTSP control endpoint (usually one shared
//!   deployment-wide port).
//! - **Rtcp**: per-session RTCP feedback endpoint.
//!
//! [`udp::UdpChannelProvider`] is the std-socket implementation used by
//! [`Server`](crate::Server).

pub mod udp;

#[cfg(test)]
pub(crate) mod recording;

use std::fmt;
use std::net::SocketAddr;

use crate::error::Result;

pub use udp::UdpChannelProvider;

/// What an endpoint is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    Register,
    Control,
    Rtcp,
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register => write!(f, "register"),
            Self::Control => write!(f, "control"),
            Self::Rtcp => write!(f, "rtcp"),
        }
    }
}

/// An open endpoint, identified by owner and role.
///
/// `local_addr` is the address actually bound, so a request for port 0
/// resolves to the ephemeral port the provider picked.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub owner: String,
    pub role: ChannelRole,
    pub local_addr: SocketAddr,
}

/// Opens, closes and sends over transport endpoints on behalf of the core.
///
/// Implementations must be safe to call from concurrent handler threads.
/// `send` must not wait for delivery.
pub trait ChannelProvider: Send + Sync {
    /// Open (or join) an endpoint bound to `addr` for `owner` in `role`.
    fn open(&self, owner: &str, addr: SocketAddr, role: ChannelRole) -> Result<Endpoint>;

    /// Close the endpoint held by `owner` in `role`.
    ///
    /// Returns `false` when nothing was open.
    fn close(&self, owner: &str, role: ChannelRole) -> bool;

    /// Send `payload` from `endpoint` to `dest`.
    fn send(&self, endpoint: &Endpoint, dest: SocketAddr, payload: &[u8]) -> Result<usize>;
}
