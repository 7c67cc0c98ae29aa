//! Per-unit session entities.
//!
//! A [`Session`] is the server-side record for one remote streaming unit.
//! It is created by the [`SessionRegistry`] on the unit's first registration
//! attempt and tracks:
//!
//! - The unit id (registry key) and a fresh per-entity session id.
//! - The lifecycle state, driven by [`state::SessionState`].
//! - The control and RTCP endpoints opened for it.
//! - Port leases (per-session RTCP port, negotiated client port) taken from
//!   the [`PortPool`].
//! - A congestion hint and an optional weak link to a media streamer.
//!
//! ## Session lifecycle
//!
//! ```text
//! first REGISTER        -> Unregistered   (response NOT_AUTHORIZED)
//! REGISTER, good nonce  -> Registered     (response SUCCESS)
//! REGISTER, bad nonce   -> Closed         (response WRONG_NONCE, removed)
//! UNREGISTER / shutdown -> Closed         (removed)
//! ```

pub mod registry;
pub mod state;

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::error::{RelayError, Result};
use crate::resource::PortPool;
use crate::transport::Endpoint;

pub use registry::SessionRegistry;
pub use state::{SessionEvent, SessionState};

/// Media-streaming association attached to a session.
///
/// The session only keeps a weak reference: the streamer's lifetime is
/// owned elsewhere, and a session never creates or destroys one.
pub trait Streamer: Send + Sync {
    /// Identifier of the streamer, for logging.
    fn id(&self) -> &str;
}

/// A single unit's session.
///
/// Shared as `Arc<Session>`; all mutable fields use interior mutability so
/// concurrent handler threads can read and update it.
#[derive(Debug)]
pub struct Session {
    /// Identity of the remote unit (registry key).
    pub unit_id: String,
    /// Fresh identifier of this entity (16-char hex string). A unit that
    /// re-registers after close gets a new one.
    pub id: String,
    control: Endpoint,
    rtcp: Endpoint,
    /// RTCP port leased from the pool, `None` for a fixed deployment port.
    rtcp_lease: Mutex<Option<u16>>,
    client_port: Mutex<Option<u16>>,
    state: RwLock<SessionState>,
    congestion_level: AtomicI32,
    streamer: RwLock<Option<Weak<dyn Streamer>>>,
    created_at: Instant,
    last_seen: Mutex<Instant>,
    ports: Arc<PortPool>,
}

impl Session {
    pub(crate) fn new(
        unit_id: &str,
        control: Endpoint,
        rtcp: Endpoint,
        rtcp_lease: Option<u16>,
        ports: Arc<PortPool>,
    ) -> Self {
        let now = Instant::now();
        Session {
            unit_id: unit_id.to_string(),
            id: format!("{:016X}", rand::random::<u64>()),
            control,
            rtcp,
            rtcp_lease: Mutex::new(rtcp_lease),
            client_port: Mutex::new(None),
            state: RwLock::new(SessionState::Unregistered),
            congestion_level: AtomicI32::new(0),
            streamer: RwLock::new(None),
            created_at: now,
            last_seen: Mutex::new(now),
            ports,
        }
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Whether the registration handshake has succeeded.
    pub fn is_registered(&self) -> bool {
        *self.state.read() == SessionState::Registered
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().is_terminal()
    }

    /// Apply `event` atomically and return the new state.
    ///
    /// The check and the store happen under one write lock, so two racing
    /// events cannot both succeed from the same source state.
    pub fn transition(&self, event: SessionEvent) -> Result<SessionState> {
        let mut state = self.state.write();
        let from = *state;
        let to = from
            .next(event)
            .ok_or(RelayError::InvalidTransition { from, event })?;
        *state = to;

        if from != to {
            tracing::debug!(
                unit_id = %self.unit_id,
                session_id = %self.id,
                old_state = %from,
                new_state = %to,
                %event,
                "state transition"
            );
        }
        Ok(to)
    }

    pub fn control_endpoint(&self) -> &Endpoint {
        &self.control
    }

    pub fn rtcp_endpoint(&self) -> &Endpoint {
        &self.rtcp
    }

    /// The local RTCP port this session listens on.
    pub fn rtcp_port(&self) -> u16 {
        self.rtcp.local_addr.port()
    }

    /// Port negotiated with the remote peer, if any.
    pub fn client_port(&self) -> Option<u16> {
        *self.client_port.lock()
    }

    /// Record the port negotiated with the remote peer.
    ///
    /// Port 0 is rejected without touching state. Setting the current value
    /// again is a no-op. Otherwise the new port is claimed from the pool and
    /// the previous one is released back to it.
    pub fn set_client_port(&self, port: u16) -> Result<()> {
        if port == 0 {
            tracing::warn!(session_id = %self.id, port, "client port not set up");
            return Err(RelayError::InvalidPort(port));
        }

        let mut current = self.client_port.lock();
        if self.is_closed() {
            return Err(RelayError::SessionClosed(self.unit_id.clone()));
        }
        if *current == Some(port) {
            return Ok(());
        }

        self.ports.claim(port, &self.unit_id)?;
        if let Some(old) = current.replace(port) {
            self.ports.restore(old);
        }

        tracing::debug!(session_id = %self.id, port, "client port set up");
        Ok(())
    }

    pub fn congestion_level(&self) -> i32 {
        self.congestion_level.load(Ordering::Relaxed)
    }

    pub fn set_congestion_level(&self, level: i32) {
        self.congestion_level.store(level, Ordering::Relaxed);
    }

    /// The associated streamer, if one is attached and still alive.
    pub fn streamer(&self) -> Option<Arc<dyn Streamer>> {
        self.streamer.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn set_streamer(&self, streamer: &Arc<dyn Streamer>) {
        tracing::debug!(session_id = %self.id, streamer = streamer.id(), "streamer attached");
        *self.streamer.write() = Some(Arc::downgrade(streamer));
    }

    pub fn clear_streamer(&self) {
        *self.streamer.write() = None;
    }

    /// Record activity from the unit.
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the unit was last heard from.
    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Return every port lease held by this session to the pool.
    ///
    /// Leases are taken out of the session as they are released, so calling
    /// this twice restores nothing the second time.
    pub(crate) fn release_ports(&self) -> Vec<u16> {
        let mut released = Vec::new();
        for lease in [self.rtcp_lease.lock().take(), self.client_port.lock().take()]
            .into_iter()
            .flatten()
        {
            if self.ports.restore(lease) {
                released.push(lease);
            }
        }
        released
    }
}
