use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{RelayError, Result};
use crate::resource::PortPool;
use crate::session::{Session, SessionEvent};
use crate::transport::{ChannelProvider, ChannelRole};

/// Thread-safe table of live sessions, keyed by unit id.
///
/// Every mutation (create, close, destroy) runs under one registry-wide
/// `parking_lot::Mutex`, held only for the map update plus the local
/// endpoint and port bookkeeping that must commit with it. Authentication
/// work in the handler happens outside the lock.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, Arc<Session>>>>,
    ports: Arc<PortPool>,
    channels: Arc<dyn ChannelProvider>,
    /// Fixed deployment-wide RTCP port; `None` leases one per session.
    rtcp_port: Option<u16>,
}

impl SessionRegistry {
    pub fn new(
        ports: Arc<PortPool>,
        channels: Arc<dyn ChannelProvider>,
        rtcp_port: Option<u16>,
    ) -> Self {
        SessionRegistry {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            ports,
            channels,
            rtcp_port,
        }
    }

    /// Create and register a session for `unit_id` with its control
    /// endpoint bound to `control_addr`.
    ///
    /// All-or-nothing: if the RTCP port cannot be leased or either endpoint
    /// cannot be opened, everything acquired so far is released and no entry
    /// is added. Returns [`RelayError::SessionExists`] when the unit already
    /// has a session.
    pub fn create(&self, unit_id: &str, control_addr: SocketAddr) -> Result<Arc<Session>> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(unit_id) {
            return Err(RelayError::SessionExists(unit_id.to_string()));
        }

        let session = self.provision(unit_id, control_addr)?;
        sessions.insert(unit_id.to_string(), session.clone());

        tracing::info!(
            unit_id,
            session_id = %session.id,
            control = %session.control_endpoint().local_addr,
            rtcp_port = session.rtcp_port(),
            total_sessions = sessions.len(),
            "session created"
        );
        Ok(session)
    }

    fn provision(&self, unit_id: &str, control_addr: SocketAddr) -> Result<Arc<Session>> {
        let (rtcp_port, rtcp_lease) = match self.rtcp_port {
            Some(port) => (port, None),
            None => {
                let port = self.ports.allocate(unit_id)?;
                (port, Some(port))
            }
        };

        let control = match self.channels.open(unit_id, control_addr, ChannelRole::Control) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                if let Some(port) = rtcp_lease {
                    self.ports.restore(port);
                }
                return Err(e);
            }
        };

        let rtcp_addr = SocketAddr::new(control_addr.ip(), rtcp_port);
        let rtcp = match self.channels.open(unit_id, rtcp_addr, ChannelRole::Rtcp) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.channels.close(unit_id, ChannelRole::Control);
                if let Some(port) = rtcp_lease {
                    self.ports.restore(port);
                }
                return Err(e);
            }
        };

        Ok(Arc::new(Session::new(
            unit_id,
            control,
            rtcp,
            rtcp_lease,
            self.ports.clone(),
        )))
    }

    /// Look up a session by unit id.
    pub fn find(&self, unit_id: &str) -> Result<Arc<Session>> {
        self.get(unit_id)
            .ok_or_else(|| RelayError::SessionNotFound(unit_id.to_string()))
    }

    pub fn get(&self, unit_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(unit_id).cloned()
    }

    /// Close `session` with `event` and remove it from the registry.
    ///
    /// Only the exact entity passed in is closed. If the unit's entry has
    /// already been replaced or removed, nothing happens and `Ok(false)` is
    /// returned. Fails without side effects when the state machine has no
    /// edge for `event`.
    pub fn close(&self, session: &Arc<Session>, event: SessionEvent) -> Result<bool> {
        let mut sessions = self.sessions.lock();
        match sessions.get(&session.unit_id) {
            Some(current) if Arc::ptr_eq(current, session) => {}
            _ => return Ok(false),
        }

        session.transition(event)?;
        sessions.remove(&session.unit_id);
        self.teardown(session, event, sessions.len());
        Ok(true)
    }

    /// Unregister and remove the session for `unit_id`.
    ///
    /// Returns `false` when no session exists, so a second destroy is a no-op.
    pub fn destroy(&self, unit_id: &str) -> bool {
        let Some(session) = self.get(unit_id) else {
            return false;
        };
        match self.close(&session, SessionEvent::Unregister) {
            Ok(closed) => closed,
            Err(e) => {
                tracing::warn!(unit_id, error = %e, "failed to destroy session");
                false
            }
        }
    }

    /// Close every live session (used at shutdown).
    ///
    /// Works from a snapshot of the entries, so sessions destroyed
    /// concurrently are skipped rather than corrupting the traversal.
    pub fn destroy_all(&self) -> usize {
        let snapshot = self.sessions();
        let mut closed = 0;
        for session in &snapshot {
            match self.close(session, SessionEvent::Shutdown) {
                Ok(true) => closed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(unit_id = %session.unit_id, error = %e, "failed to close session");
                }
            }
        }
        if closed > 0 {
            tracing::info!(closed, "all sessions closed");
        }
        closed
    }

    /// Close sessions that have been idle for at least `max_idle`.
    pub fn expire_idle(&self, max_idle: Duration) -> usize {
        let idle: Vec<Arc<Session>> = self
            .sessions()
            .into_iter()
            .filter(|s| s.idle_for() >= max_idle)
            .collect();

        let mut expired = 0;
        for session in &idle {
            if let Ok(true) = self.close(session, SessionEvent::Expired) {
                expired += 1;
            }
        }
        if expired > 0 {
            tracing::info!(expired, ?max_idle, "expired idle sessions");
        }
        expired
    }

    fn teardown(&self, session: &Session, event: SessionEvent, remaining: usize) {
        self.channels.close(&session.unit_id, ChannelRole::Control);
        self.channels.close(&session.unit_id, ChannelRole::Rtcp);
        let released = session.release_ports();

        tracing::info!(
            unit_id = %session.unit_id,
            session_id = %session.id,
            %event,
            ?released,
            total_sessions = remaining,
            "session closed"
        );
    }

    /// Snapshot of all live sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Snapshot of sessions that completed the handshake.
    pub fn registered_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .lock()
            .values()
            .filter(|s| s.is_registered())
            .cloned()
            .collect()
    }

    pub fn unit_ids(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn ports(&self) -> &Arc<PortPool> {
        &self.ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use crate::transport::recording::RecordingChannels;
    use std::net::{IpAddr, Ipv4Addr};

    fn control() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8554)
    }

    fn registry(capacity: u16) -> (SessionRegistry, Arc<RecordingChannels>) {
        let channels = Arc::new(RecordingChannels::new());
        let pool = Arc::new(PortPool::new(20000..=20000 + capacity - 1));
        (SessionRegistry::new(pool, channels.clone(), None), channels)
    }

    #[test]
    fn create_then_find() {
        let (reg, channels) = registry(10);
        let created = reg.create("cam-01", control()).unwrap();
        let found = reg.find("cam-01").unwrap();
        assert!(Arc::ptr_eq(&created, &found));
        assert_eq!(found.state(), SessionState::Unregistered);
        assert!(channels.is_open("cam-01", ChannelRole::Control));
        assert!(channels.is_open("cam-01", ChannelRole::Rtcp));
        assert_eq!(reg.ports().owner(found.rtcp_port()).as_deref(), Some("cam-01"));
    }

    #[test]
    fn find_unknown_is_not_found() {
        let (reg, _) = registry(10);
        assert!(matches!(
            reg.find("nope"),
            Err(RelayError::SessionNotFound(_))
        ));
    }

    #[test]
    fn duplicate_create_is_refused() {
        let (reg, _) = registry(10);
        reg.create("cam-01", control()).unwrap();
        let free = reg.ports().free_count();
        assert!(matches!(
            reg.create("cam-01", control()),
            Err(RelayError::SessionExists(_))
        ));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.ports().free_count(), free);
    }

    #[test]
    fn exhausted_pool_creates_nothing() {
        let (reg, channels) = registry(1);
        reg.create("cam-01", control()).unwrap();
        assert!(matches!(
            reg.create("cam-02", control()),
            Err(RelayError::PortPoolExhausted)
        ));
        assert!(reg.get("cam-02").is_none());
        assert!(!channels.is_open("cam-02", ChannelRole::Control));
    }

    #[test]
    fn failed_rtcp_open_rolls_back() {
        let (reg, channels) = registry(4);
        *channels.fail_role.lock() = Some(ChannelRole::Rtcp);

        assert!(matches!(
            reg.create("cam-01", control()),
            Err(RelayError::Io(_))
        ));
        assert!(reg.is_empty());
        assert_eq!(channels.open_count(), 0);
        assert_eq!(reg.ports().free_count(), 4);
    }

    #[test]
    fn destroy_releases_everything_once() {
        let (reg, channels) = registry(4);
        let session = reg.create("cam-01", control()).unwrap();
        session.set_client_port(20003).unwrap();
        assert_eq!(reg.ports().free_count(), 2);

        assert!(reg.destroy("cam-01"));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(reg.ports().free_count(), 4);
        assert_eq!(channels.close_count("cam-01"), 2);

        assert!(!reg.destroy("cam-01"));
        assert_eq!(reg.ports().free_count(), 4);
        assert_eq!(channels.close_count("cam-01"), 2);
    }

    #[test]
    fn client_ports_never_alias_live_leases() {
        let (reg, _) = registry(4);
        let a = reg.create("cam-01", control()).unwrap();
        let b = reg.create("cam-02", control()).unwrap();

        // Neither its own RTCP lease nor another session's can be taken.
        assert!(matches!(
            a.set_client_port(a.rtcp_port()),
            Err(RelayError::PortInUse { .. })
        ));
        assert!(matches!(
            a.set_client_port(b.rtcp_port()),
            Err(RelayError::PortInUse { .. })
        ));

        let free = reg.ports().allocate("scratch").unwrap();
        reg.ports().restore(free);
        a.set_client_port(free).unwrap();
        assert!(matches!(
            b.set_client_port(free),
            Err(RelayError::PortInUse { .. })
        ));

        // Pool is now full: a third unit must not be handed a held port.
        assert!(reg.ports().is_allocated(a.rtcp_port()));
        let c = reg.create("cam-03", control()).unwrap();
        let held = [a.rtcp_port(), b.rtcp_port(), free];
        assert!(!held.contains(&c.rtcp_port()));
        assert!(matches!(
            reg.create("cam-04", control()),
            Err(RelayError::PortPoolExhausted)
        ));

        assert_eq!(reg.destroy_all(), 3);
        assert_eq!(reg.ports().free_count(), 4);
    }

    #[test]
    fn recreate_after_close_is_a_new_entity() {
        let (reg, _) = registry(4);
        let first = reg.create("cam-01", control()).unwrap();
        reg.destroy("cam-01");
        let second = reg.create("cam-01", control()).unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(second.state(), SessionState::Unregistered);
        assert!(first.is_closed());
    }

    #[test]
    fn close_ignores_stale_entity() {
        let (reg, _) = registry(4);
        let stale = reg.create("cam-01", control()).unwrap();
        reg.destroy("cam-01");
        let fresh = reg.create("cam-01", control()).unwrap();

        assert!(!reg.close(&stale, SessionEvent::NonceRejected).unwrap());
        assert!(Arc::ptr_eq(&reg.find("cam-01").unwrap(), &fresh));
        assert_eq!(fresh.state(), SessionState::Unregistered);
    }

    #[test]
    fn close_with_invalid_event_has_no_effect() {
        let (reg, channels) = registry(4);
        let session = reg.create("cam-01", control()).unwrap();
        session.transition(SessionEvent::NonceAccepted).unwrap();

        assert!(matches!(
            reg.close(&session, SessionEvent::NonceRejected),
            Err(RelayError::InvalidTransition { .. })
        ));
        assert!(reg.get("cam-01").is_some());
        assert!(session.is_registered());
        assert!(channels.is_open("cam-01", ChannelRole::Rtcp));
    }

    #[test]
    fn destroy_all_empties_registry_and_pool() {
        let (reg, channels) = registry(8);
        for i in 0..5 {
            reg.create(&format!("cam-{i}"), control()).unwrap();
        }
        assert_eq!(reg.ports().free_count(), 3);

        assert_eq!(reg.destroy_all(), 5);
        assert!(reg.is_empty());
        assert_eq!(reg.ports().free_count(), 8);
        assert_eq!(channels.open_count(), 0);
        assert_eq!(reg.destroy_all(), 0);
    }

    #[test]
    fn fixed_rtcp_port_skips_the_pool() {
        let channels = Arc::new(RecordingChannels::new());
        let pool = Arc::new(PortPool::new(20000..=20003));
        let reg = SessionRegistry::new(pool.clone(), channels, Some(19001));

        let session = reg.create("cam-01", control()).unwrap();
        assert_eq!(session.rtcp_port(), 19001);
        assert_eq!(pool.free_count(), 4);
        reg.destroy("cam-01");
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn expire_idle_closes_only_idle_sessions() {
        let (reg, _) = registry(4);
        reg.create("cam-01", control()).unwrap();
        assert_eq!(reg.expire_idle(Duration::from_secs(3600)), 0);
        assert_eq!(reg.expire_idle(Duration::ZERO), 1);
        assert!(reg.is_empty());
        assert_eq!(reg.ports().free_count(), 4);
    }

    #[test]
    fn concurrent_create_yields_one_session() {
        let (reg, _) = registry(16);
        let wins = std::sync::atomic::AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| match reg.create("cam-01", control()) {
                    Ok(_) => {
                        wins.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }
                    Err(RelayError::SessionExists(_)) => {}
                    Err(e) => panic!("unexpected error: {e}"),
                });
            }
        });
        assert_eq!(wins.into_inner(), 1);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.ports().free_count(), 15);
    }

    #[test]
    fn concurrent_destroy_and_destroy_all() {
        let (reg, _) = registry(64);
        for i in 0..32 {
            reg.create(&format!("cam-{i}"), control()).unwrap();
        }
        std::thread::scope(|s| {
            s.spawn(|| reg.destroy_all());
            s.spawn(|| {
                for i in 0..32 {
                    reg.destroy(&format!("cam-{i}"));
                }
            });
        });
        assert!(reg.is_empty());
        assert_eq!(reg.ports().free_count(), 64);
    }
}
